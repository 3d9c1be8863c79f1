/// Fallible asynchronous counterpart to `TryFrom<T>`.
///
/// Used for conversions that have to touch the disk, such as loading a
/// persisted patch from its path.
pub trait AsyncTryFrom<T>: Sized {
    type Error;

    async fn async_try_from(value: T) -> Result<Self, Self::Error>;
}

/// Async counterpart to `TryInto<T>`.
pub trait AsyncTryInto<T> {
    type Error;

    async fn async_try_into(self) -> Result<T, Self::Error>;
}

impl<T, U> AsyncTryInto<U> for T
where
    U: AsyncTryFrom<T>,
{
    type Error = U::Error;

    async fn async_try_into(self) -> Result<U, Self::Error> {
        U::async_try_from(self).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::{Path, PathBuf};
    use tempfile::TempDir;

    struct FileLength(u64);

    impl AsyncTryFrom<&Path> for FileLength {
        type Error = std::io::Error;

        async fn async_try_from(path: &Path) -> Result<Self, Self::Error> {
            let bytes = compio::fs::read(path).await?;
            Ok(FileLength(bytes.len() as u64))
        }
    }

    #[compio::test]
    async fn test_async_try_from_reads_file() {
        let temp_dir = TempDir::new().expect("Failed to create temp directory");
        let path = temp_dir.path().join("content");
        std::fs::write(&path, b"abc").expect("Failed to write file");

        let length = FileLength::async_try_from(path.as_path()).await.unwrap();
        assert_eq!(length.0, 3);
    }

    #[compio::test]
    async fn test_async_try_into_propagates_errors() {
        let path = PathBuf::from("/this/path/does/not/exist");
        let result: Result<FileLength, _> = path.as_path().async_try_into().await;
        assert!(result.is_err());
    }
}
