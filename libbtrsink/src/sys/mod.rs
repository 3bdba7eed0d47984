pub mod btrfs;
pub mod fs;
pub mod net;
pub mod process;
