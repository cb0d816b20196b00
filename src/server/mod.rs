// SMP server: queue store, subscriptions, session loop, listeners

pub mod config;
pub mod server;
pub mod session;
pub mod store;
pub mod subscription;

pub use config::ServerConfig;
pub use server::ServerInstance;
pub use session::ServerCtx;
pub use store::{Message, QueueRec, QueueStatus, QueueStore, StoreError, MSG_QUEUE_QUOTA};
pub use subscription::SubscriptionManager;
