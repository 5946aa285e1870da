// ── Reactive data store ──

mod collection;
mod registry;

pub use registry::DeviceRegistry;
