/*!
 * Synchronization tests entry point
 */

#[path = "sync/lock_file_test.rs"]
mod lock_file_test;

#[path = "sync/multi_lock_test.rs"]
mod multi_lock_test;

#[path = "sync/nesting_props.rs"]
mod nesting_props;
