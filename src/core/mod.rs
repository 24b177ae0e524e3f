/// Routing core: pools, the backends they own, and the connection seam
pub mod backend;
pub mod connection;
pub mod pool;

pub use backend::Backend;
pub use connection::{ConnId, ConnOwner, Connection, DryConnection, DryRunTransport, Transport};
pub use pool::Pool;
