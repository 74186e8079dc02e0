//! Coefficient design for the cascade stages

pub mod elliptic;
pub mod notch;
pub mod remez;
pub mod special;
