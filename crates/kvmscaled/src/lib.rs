//! Library surface of the kvmscaled binary: the supervisor that wires
//! policies, controller, load balancer, and discovery together.

pub mod supervisor;

pub use supervisor::Supervisor;
