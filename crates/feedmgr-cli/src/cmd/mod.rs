pub mod access;
pub mod feed;
pub mod init;
pub mod template;
