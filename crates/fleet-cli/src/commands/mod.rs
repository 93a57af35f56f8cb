pub mod access_point;
pub mod bundle;
pub mod package;
