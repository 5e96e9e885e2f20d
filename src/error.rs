use embassy_time::TimeoutError;

#[derive(Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[non_exhaustive]
pub enum Error {
    /// A formatted command did not fit the bounded scratch buffer. The
    /// transport was not touched.
    Overflow,
    /// The response bytes were requested as a string but are not UTF-8.
    InvalidUtf8,
    /// No response arrived within the configured command timeout.
    Timeout,
    /// The channel is closed, or was closed while waiting for a response.
    Closed,
    /// The serial transport failed.
    Serial,
    /// [config](crate::AtChannel::config) exhausted its attempts without
    /// reading back the requested value.
    Unconfirmed,
}

impl From<TimeoutError> for Error {
    fn from(_: TimeoutError) -> Self {
        Error::Timeout
    }
}
