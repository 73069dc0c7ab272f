/*!
 * Page Locking
 *
 * The call sequence storage operations wrap around each page access. The
 * protocol is the first layer that makes policy decisions: retry after a
 * generation change, run an integrity pass after owner death, or fail.
 */

pub mod protocol;
pub mod traits;
pub mod types;

pub use protocol::PageLocker;
pub use traits::PageStore;
pub use types::{Acquisition, PageRequest, ProtocolState};
