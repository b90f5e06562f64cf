//! Background worker registration and lifecycle.

mod controller;
mod platform;
mod registration;
mod runtime;

pub use controller::LifecycleController;
pub use platform::{WorkerEvent, WorkerPlatform};
pub use registration::{
    ClientId, LifecycleState, Registration, RegistrationInfo, Worker, WorkerId, WorkerInfo, WorkerState,
};
pub use runtime::LocalWorkerRuntime;
