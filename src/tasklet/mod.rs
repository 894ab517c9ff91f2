//! The tasklet record: identity, packed atomic status word, function slot.

mod id;
pub use id::{Gid, TaskletId};

mod status;
pub use status::{Priority, Status, TaskletState, TaskletStateEx};

mod record;
pub use record::{InitData, Tasklet, TaskletFn};
