// Facade crate: re-exports the sandboxd workspace libraries.

pub use sbx_core as core;
pub use sbx_gateway as gateway;
pub use sbx_isolation as isolation;
pub use sbx_runtime as runtime;
pub use sbx_snapshot as snapshot;
pub use sbx_storage as storage;
