pub mod handlers;
pub mod pool;
pub mod registry;
pub mod selector;

pub use handlers::{
    register_builtin_handlers, DataCleanupHandler, StatusChangeNotificationHandler,
    WelcomeEmailHandler,
};
pub use pool::{WorkerPool, WorkerPoolConfig, WorkerState};
pub use registry::{handler_fn, FnHandler, TaskContext, TaskHandler, TaskRegistry, TaskRegistryBuilder};
pub use selector::{QueuePolicy, QueueSelector};
