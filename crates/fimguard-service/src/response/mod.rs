pub mod controller;
pub mod notifier;
