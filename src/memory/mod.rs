pub mod backing;
pub mod cache;
pub(crate) mod loom_tests;
pub mod manager;
pub mod partition;
pub mod physical;
pub mod placeholder;
pub mod range;
pub mod registry;
pub mod reserver;
pub mod sim;
pub mod stats;
#[cfg(not(loom))]
pub mod uncommitter;
pub mod vm;

#[cfg(test)]
crate::sync::static_rwlock! {
    pub static TEST_MUTEX: crate::sync::RwLock<()> = crate::sync::RwLock::new(());
}
