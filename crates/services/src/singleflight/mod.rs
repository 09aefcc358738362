//! 单飞协调：进程内合并 + 集群租约

mod coordinator;
mod lease_guard;

pub use coordinator::{
    FlightOrigin, FlightResult, LeaseOptions, SingleflightCoordinator, SingleflightError,
};
