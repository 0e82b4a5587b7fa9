pub mod records;
pub mod session_record;
pub mod session_state;

pub use records::{PreKeyRecord, SignedPreKeyRecord};
pub use session_record::SessionRecord;
pub use session_state::SessionState;
