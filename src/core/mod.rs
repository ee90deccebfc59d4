pub mod cache;
pub mod coordinator;
pub mod dependency;
pub mod hierarchy;
pub mod locks;
pub mod resolver;

pub use cache::DerivedCache;
pub use coordinator::GraphCoordinator;
pub use dependency::DependencyValidator;
pub use hierarchy::HierarchyValidator;
pub use locks::OwnerLocks;
pub use resolver::CompletionResolver;
