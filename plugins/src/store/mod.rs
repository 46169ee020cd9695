mod file;

pub use file::FileStore;
