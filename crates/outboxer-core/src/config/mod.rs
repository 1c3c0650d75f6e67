//! Configuration - 設定値・handler・lifecycle hook・plugin
//!
//! - **settings**: スカラー設定と TOML ファイル
//! - **hooks**: lifecycle hook の型付きスロット
//! - **builder**: `ConfigurationBuilder` と凍結済み `Configuration`
//! - **plugin**: `Plugin` trait と明示的な `PluginRegistry`

pub mod builder;
pub mod hooks;
pub mod plugin;
pub mod settings;

pub use builder::{ArgumentTransform, Configuration, ConfigurationBuilder};
pub use hooks::{HookKind, LifecycleHooks};
pub use plugin::{Plugin, PluginRegistry, TracingPlugin};
pub use settings::{FileSettings, InboxSettings, Settings, WorkerMode, validate_identifier};
