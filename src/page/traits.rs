/*!
 * Page Store Traits
 * What the page lock protocol needs from the storage engine
 */

use crate::core::errors::LockResult;
use crate::core::types::Access;

/// Storage engine collaborator
///
/// Generation checks are evaluated while the protocol holds a lock, so a
/// `true` answer means another process replaced or resized the resource
/// since this handle last mapped it.
pub trait PageStore {
    /// Hash of a record key
    fn hash(&self, key: &[u8]) -> u32;

    /// Page holding records with this hash
    fn page_of(&self, hash: u32) -> u32;

    fn is_read_only(&self) -> bool {
        false
    }

    /// Resource was replaced by a new file generation
    fn is_replaced(&self) -> bool;

    /// Resource was resized
    fn size_changed(&self) -> bool;

    /// Reopen the replacement; called with the exclusive lock held
    fn replace(&mut self) -> LockResult<()>;

    /// Remap after a resize; called with the exclusive lock held
    fn remap(&mut self) -> LockResult<()>;

    /// Cached directory no longer matches the shared header
    fn dir_generation_changed(&self) -> bool;

    fn sync_dir(&mut self);

    /// Verify the data after a lock holder died; returns the error count
    fn check_integrity(&mut self) -> usize;

    /// Optional backing-store lock, taken after the local lock
    fn backing_lock(&mut self, _key: Option<&[u8]>, _access: Access) -> LockResult<()> {
        Ok(())
    }

    /// Release the backing-store lock, before the local lock
    fn backing_unlock(&mut self, _key: Option<&[u8]>) {}
}
