pub mod event;
pub mod exit;
pub mod handle;
pub mod info;
pub mod kernelexit;
pub mod process;
pub mod rendez;
pub mod sched;

pub use self::handle::{HandleEntry, HandleObject, HandleTable, HandleType};
pub use self::kernelexit::{kernel_exit, ExitAction};
pub use self::process::{KernelTask, ProcState, Process, ProcessId};
pub use self::rendez::{Rendez, RendezId};
pub use self::sched::Scheduler;
