//! Shared data models

pub mod dtc;
pub mod live;
pub mod operation;
pub mod result;
