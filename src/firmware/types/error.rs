use crate::firmware::{meter::MeterError, net::RegistryError, upload::UploadError};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FirmwareError {
    NoSources,
    NoTimeReference,
    RadioUnavailable,
    Registry(RegistryError),
    Meter(MeterError),
    Upload(UploadError),
}

impl FirmwareError {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::NoSources => "no data sources configured",
            Self::NoTimeReference => "no time reference",
            Self::RadioUnavailable => "radio unavailable",
            Self::Registry(err) => err.as_str(),
            Self::Meter(err) => err.as_str(),
            Self::Upload(err) => err.as_str(),
        }
    }

    /// Startup faults stop the firmware; everything else is logged per tick.
    pub const fn is_fatal(self) -> bool {
        matches!(
            self,
            Self::NoSources | Self::NoTimeReference | Self::RadioUnavailable | Self::Registry(_)
        )
    }
}

impl From<RegistryError> for FirmwareError {
    fn from(err: RegistryError) -> Self {
        Self::Registry(err)
    }
}

impl From<MeterError> for FirmwareError {
    fn from(err: MeterError) -> Self {
        Self::Meter(err)
    }
}

impl From<UploadError> for FirmwareError {
    fn from(err: UploadError) -> Self {
        Self::Upload(err)
    }
}
