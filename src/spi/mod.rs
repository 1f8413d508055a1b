pub mod backend;
pub mod protocol;
pub mod sd_disk;

mod init;
mod link;
