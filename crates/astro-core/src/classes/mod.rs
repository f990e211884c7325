//! Generic endpoints for the common device classes.
//!
//! Each endpoint owns its CONNECTION machine, its dispatch queue and the
//! operation runners for its class, and talks to hardware only through the
//! capability traits. A multi-interface camera driver builds one
//! [`CcdEndpoint`], and optionally a [`GuiderEndpoint`] and a
//! [`WheelEndpoint`], all holding the same shared device.

mod ccd;
mod guider;
mod wheel;

pub use ccd::{CcdEndpoint, ExposureOperation};
pub use guider::{GuidePulseOperation, GuiderEndpoint};
pub use wheel::{WheelEndpoint, WheelMoveOperation};

use crate::endpoint::PropertyChange;
use crate::error::AstroError;

fn unknown_property(device: &str, change: &PropertyChange) -> anyhow::Error {
    AstroError::UnknownProperty {
        device: device.to_string(),
        name: change.property.clone(),
    }
    .into()
}
