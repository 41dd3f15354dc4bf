//! copr keeps a fleet of long-running programs alive.
//!
//! A workspace directory holds one sub-directory per unit; each unit is kept
//! running by a [`guard::Guard`], all guards are owned by a
//! [`control::Controller`], and operators drive the fleet through the
//! authenticated HTTP control plane in [`service`].

pub mod archive;
pub mod command;
pub mod control;
pub mod error;
pub mod guard;
pub mod secrets;
pub mod service;
pub mod stats;
pub mod unit;

/// Shared with `copr-dummy` and the integration tests.
#[doc(hidden)]
pub mod testkit;

/// Build metadata stamped by build.rs.
pub fn build_banner() -> String {
    format!(
        "copr {} (built {} on {})",
        env!("CARGO_PKG_VERSION"),
        option_env!("COPR_BUILD_TIME").unwrap_or("unknown"),
        option_env!("COPR_BUILD_HOST").unwrap_or("unknown"),
    )
}
