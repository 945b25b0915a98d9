//! Small arithmetic and formatting helpers.

pub(crate) mod layout;
pub(crate) mod size;
