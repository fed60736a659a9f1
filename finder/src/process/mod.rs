//! Tool server processes
//!
//! - [`build_process_spec`]: template + mode + base env → argv, env, workdir
//! - [`Supervisor`]: concurrent launch, readiness, monitoring and restart
//! - [`RuntimeStatus`]: what the supervisor knows about each service

mod command;
mod status;
mod supervisor;

pub use command::{build_process_spec, ServiceProcessSpec};
pub use status::{
    classify_exit, is_permanent_failure, ExitDisposition, RuntimeStatus, ServiceProcess,
    ServiceState, WARN_DEFINITION_MISSING, WARN_EXITED_NORMALLY, WARN_PERMANENT_FAILURE,
    WARN_RESTART_LIMIT,
};
pub use supervisor::{
    default_base_env, Supervisor, SupervisorOptions, DEFAULT_MAX_RESTARTS,
    DEFAULT_READINESS_TIMEOUT, SHUTDOWN_GRACE,
};
