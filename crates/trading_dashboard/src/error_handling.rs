use std::fmt;

/// Logs an error and turns the result into an `Option`, for failures that
/// must not interrupt the caller.
pub trait ResultExt<E> {
    type Ok;

    fn log_err(self) -> Option<Self::Ok>;
    fn warn_on_err(self) -> Option<Self::Ok>;
}

impl<T, E> ResultExt<E> for Result<T, E>
where
    E: fmt::Debug,
{
    type Ok = T;

    #[track_caller]
    fn log_err(self) -> Option<T> {
        match self {
            Ok(value) => Some(value),
            Err(error) => {
                let caller = std::panic::Location::caller();
                log::error!("{}:{}: {error:?}", caller.file(), caller.line());
                None
            }
        }
    }

    #[track_caller]
    fn warn_on_err(self) -> Option<T> {
        match self {
            Ok(value) => Some(value),
            Err(error) => {
                let caller = std::panic::Location::caller();
                log::warn!("{}:{}: {error:?}", caller.file(), caller.line());
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::anyhow;

    #[test]
    fn test_log_err_discards_error() {
        let ok: anyhow::Result<u32> = Ok(3);
        assert_eq!(ok.log_err(), Some(3));

        let failed: anyhow::Result<u32> = Err(anyhow!("disk full"));
        assert_eq!(failed.log_err(), None);
        let failed: anyhow::Result<u32> = Err(anyhow!("disk full"));
        assert_eq!(failed.warn_on_err(), None);
    }
}
