use std::{error, fmt, result};

pub type BoxedError = Box<dyn error::Error + Send + Sync + 'static>;
pub type BoxedErrorResult<T> = result::Result<T, BoxedError>;

/// Displays an error followed by all of its sources, on a single line
pub struct FmtCompactError<'e, E>(pub &'e E);

impl<E> fmt::Display for FmtCompactError<'_, E>
where
    E: error::Error,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_fmt(format_args!("{}", self.0))?;

        let mut source = self.0.source();
        while let Some(err) = source {
            f.write_fmt(format_args!(": {err}"))?;
            source = err.source();
        }

        Ok(())
    }
}

pub trait FmtCompact {
    type Report: fmt::Display;
    fn fmt_compact(self) -> Self::Report;
}

impl<'e, E> FmtCompact for &'e E
where
    E: error::Error,
{
    type Report = FmtCompactError<'e, E>;

    fn fmt_compact(self) -> Self::Report {
        FmtCompactError(self)
    }
}
