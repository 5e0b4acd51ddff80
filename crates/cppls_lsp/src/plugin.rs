//! The server plugin registration ABI.
//!
//! A plugin library exposes one entry point returning a [`PluginInfo`].
//! Loading validates the API version and the definition hash (byte-equal,
//! printable) before the plugin's `register` callback runs against a
//! [`PluginBuilder`]. The dynamic loader itself lives outside the core;
//! registration is exercised in-process, which is also how tests drive it.

use std::collections::HashMap;
use std::ffi::{c_char, CStr};
use std::future::Future;
use std::pin::Pin;
use std::sync::Mutex;

use serde_json::Value;

/// Bump when [`PluginInfo`] or the entry-point signature changes.
pub const PLUGIN_API_VERSION: u32 = 1;

/// Hash of the registration surface. Regenerated when any builder hook
/// changes; plugins built against a different surface fail to load.
pub const PLUGIN_DEF_HASH: &str =
    "sha256:9f1c6a58e3b0d7427fa6cce1b4f02d88135c3be61e90a4ad6a0f5c2377c14b52";

/// Entry-point name a plugin library must export.
pub const PLUGIN_ENTRY_POINT: &str = "cppls_get_server_plugin_info";

pub type LifecycleHook =
    Box<dyn Fn() -> Pin<Box<dyn Future<Output = ()> + Send>> + Send + Sync>;
pub type CommandHandler = Box<
    dyn Fn(Vec<Value>) -> Pin<Box<dyn Future<Output = Result<Value, String>> + Send>>
        + Send
        + Sync,
>;

/// The C-compatible descriptor a plugin's entry point returns.
#[repr(C)]
pub struct PluginInfo {
    pub api_version: u32,
    pub name: *const c_char,
    pub version: *const c_char,
    pub definition_hash: *const c_char,
    pub register: Option<extern "C" fn(builder: &mut PluginBuilder)>,
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum PluginError {
    #[error("plugin api version {0} does not match server version {PLUGIN_API_VERSION}")]
    ApiVersionMismatch(u32),
    #[error("plugin definition hash mismatch: {0}")]
    DefinitionHashMismatch(String),
    #[error("plugin descriptor is missing {0}")]
    MissingField(&'static str),
}

/// Collects everything one plugin registers.
#[derive(Default)]
pub struct PluginBuilder {
    on_initialize: Vec<LifecycleHook>,
    on_initialized: Vec<LifecycleHook>,
    on_shutdown: Vec<LifecycleHook>,
    on_exit: Vec<LifecycleHook>,
    on_did_change_configuration: Vec<LifecycleHook>,
    commands: HashMap<String, CommandHandler>,
}

impl PluginBuilder {
    pub fn on_initialize(&mut self, hook: LifecycleHook) {
        self.on_initialize.push(hook);
    }

    pub fn on_initialized(&mut self, hook: LifecycleHook) {
        self.on_initialized.push(hook);
    }

    pub fn on_shutdown(&mut self, hook: LifecycleHook) {
        self.on_shutdown.push(hook);
    }

    pub fn on_exit(&mut self, hook: LifecycleHook) {
        self.on_exit.push(hook);
    }

    pub fn on_did_change_configuration(&mut self, hook: LifecycleHook) {
        self.on_did_change_configuration.push(hook);
    }

    pub fn register_command(&mut self, name: &str, handler: CommandHandler) {
        self.commands.insert(name.to_owned(), handler);
    }
}

/// Which lifecycle point to fire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Hook {
    Initialize,
    Initialized,
    Shutdown,
    Exit,
    DidChangeConfiguration,
}

/// Everything every loaded plugin registered, keyed for dispatch.
#[derive(Default)]
pub struct PluginRegistry {
    inner: Mutex<PluginBuilder>,
    loaded: Mutex<Vec<(String, String)>>,
}

impl PluginRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Validate a descriptor and run its registration callback.
    pub fn register(&self, info: &PluginInfo) -> Result<(), PluginError> {
        if info.api_version != PLUGIN_API_VERSION {
            return Err(PluginError::ApiVersionMismatch(info.api_version));
        }
        let hash = read_cstr(info.definition_hash).ok_or(PluginError::MissingField("hash"))?;
        if hash.as_bytes() != PLUGIN_DEF_HASH.as_bytes() {
            return Err(PluginError::DefinitionHashMismatch(hash.to_owned()));
        }
        let name = read_cstr(info.name).ok_or(PluginError::MissingField("name"))?;
        let version = read_cstr(info.version).ok_or(PluginError::MissingField("version"))?;
        let register = info.register.ok_or(PluginError::MissingField("register"))?;

        let mut builder = self.inner.lock().unwrap();
        register(&mut builder);
        self.loaded.lock().unwrap().push((name.to_owned(), version.to_owned()));
        tracing::info!(name, version, "plugin registered");
        Ok(())
    }

    pub fn loaded(&self) -> Vec<(String, String)> {
        self.loaded.lock().unwrap().clone()
    }

    /// Fire every registered hook of one lifecycle point, sequentially.
    pub async fn fire(&self, hook: Hook) {
        let futures: Vec<_> = {
            let builder = self.inner.lock().unwrap();
            let hooks = match hook {
                Hook::Initialize => &builder.on_initialize,
                Hook::Initialized => &builder.on_initialized,
                Hook::Shutdown => &builder.on_shutdown,
                Hook::Exit => &builder.on_exit,
                Hook::DidChangeConfiguration => &builder.on_did_change_configuration,
            };
            hooks.iter().map(|hook| hook()).collect()
        };
        for future in futures {
            future.await;
        }
    }

    /// Run a registered command handler, if any.
    pub async fn run_command(
        &self,
        name: &str,
        arguments: Vec<Value>,
    ) -> Option<Result<Value, String>> {
        let future = {
            let builder = self.inner.lock().unwrap();
            builder.commands.get(name).map(|handler| handler(arguments))
        };
        Some(future?.await)
    }

    pub fn has_command(&self, name: &str) -> bool {
        self.inner.lock().unwrap().commands.contains_key(name)
    }

    pub fn command_names(&self) -> Vec<String> {
        let mut names: Vec<String> =
            self.inner.lock().unwrap().commands.keys().cloned().collect();
        names.sort();
        names
    }
}

fn read_cstr(ptr: *const c_char) -> Option<&'static str> {
    if ptr.is_null() {
        return None;
    }
    // Plugin descriptors point at static storage in the plugin library,
    // which outlives the registry.
    unsafe { CStr::from_ptr(ptr) }.to_str().ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    static HOOK_FIRED: AtomicUsize = AtomicUsize::new(0);

    extern "C" fn register_test_plugin(builder: &mut PluginBuilder) {
        builder.on_initialized(Box::new(|| {
            Box::pin(async {
                HOOK_FIRED.fetch_add(1, Ordering::SeqCst);
            })
        }));
        builder.register_command(
            "test.echo",
            Box::new(|arguments| {
                Box::pin(async move { Ok(Value::Array(arguments)) })
            }),
        );
    }

    fn descriptor(hash: &'static CStr) -> PluginInfo {
        PluginInfo {
            api_version: PLUGIN_API_VERSION,
            name: c"test-plugin".as_ptr(),
            version: c"0.1.0".as_ptr(),
            definition_hash: hash.as_ptr(),
            register: Some(register_test_plugin),
        }
    }

    fn valid_hash() -> &'static CStr {
        // Built from the constant so the test tracks hash changes.
        static HASH: std::sync::OnceLock<std::ffi::CString> = std::sync::OnceLock::new();
        HASH.get_or_init(|| std::ffi::CString::new(PLUGIN_DEF_HASH).unwrap()).as_c_str()
    }

    #[tokio::test]
    async fn registers_and_fires_hooks() {
        let registry = PluginRegistry::new();
        registry.register(&descriptor(valid_hash())).unwrap();
        assert_eq!(registry.loaded(), vec![("test-plugin".into(), "0.1.0".into())]);

        let before = HOOK_FIRED.load(Ordering::SeqCst);
        registry.fire(Hook::Initialized).await;
        assert_eq!(HOOK_FIRED.load(Ordering::SeqCst), before + 1);
        registry.fire(Hook::Shutdown).await;
        assert_eq!(HOOK_FIRED.load(Ordering::SeqCst), before + 1);

        let result = registry
            .run_command("test.echo", vec![Value::from(1), Value::from("x")])
            .await
            .unwrap()
            .unwrap();
        assert_eq!(result, serde_json::json!([1, "x"]));
        assert!(registry.run_command("missing", Vec::new()).await.is_none());
    }

    #[tokio::test]
    async fn rejects_version_and_hash_mismatches() {
        let registry = PluginRegistry::new();

        let mut wrong_version = descriptor(valid_hash());
        wrong_version.api_version = 99;
        assert_eq!(
            registry.register(&wrong_version).unwrap_err(),
            PluginError::ApiVersionMismatch(99)
        );

        let wrong_hash = descriptor(c"sha256:0000");
        assert!(matches!(
            registry.register(&wrong_hash).unwrap_err(),
            PluginError::DefinitionHashMismatch(_)
        ));

        let mut no_register = descriptor(valid_hash());
        no_register.register = None;
        assert_eq!(
            registry.register(&no_register).unwrap_err(),
            PluginError::MissingField("register")
        );
    }
}
