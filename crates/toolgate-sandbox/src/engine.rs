//! Sandbox engine selection.
//!
//! Two engines run user programs: a script-language VM and a WebAssembly VM,
//! both supplied as prebuilt runtimes and configured as launch commands. The
//! wasm engine additionally requires a readiness flag, evaluated once at
//! startup, before it becomes selectable.

use toolgate_error::GatewayError;

/// Environment flag marking the wasm engine as provisioned.
pub const WASM_READY_ENV: &str = "TOOLGATE_WASM_READY";

/// The sandbox language requested by an execute-request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Language {
    /// The script-language VM.
    Script,
    /// The WebAssembly VM.
    Wasm,
}

impl Language {
    /// Parse the wire form of a language name.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "script" => Some(Self::Script),
            "wasm" => Some(Self::Wasm),
            _ => None,
        }
    }

    /// The wire form.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Script => "script",
            Self::Wasm => "wasm",
        }
    }
}

/// One engine's launch command.
#[derive(Debug, Clone)]
pub struct Engine {
    /// The runtime executable.
    pub command: String,
    /// Arguments to the runtime.
    pub args: Vec<String>,
}

/// The configured engines for this gateway instance.
#[derive(Debug, Clone, Default)]
pub struct EngineSet {
    script: Option<Engine>,
    wasm: Option<Engine>,
    wasm_ready: bool,
}

impl EngineSet {
    /// Assemble the engine set. `wasm_ready` is the startup-time evaluation
    /// of [`WASM_READY_ENV`].
    pub fn new(script: Option<Engine>, wasm: Option<Engine>, wasm_ready: bool) -> Self {
        Self {
            script,
            wasm,
            wasm_ready,
        }
    }

    /// The languages currently selectable.
    pub fn available(&self) -> Vec<Language> {
        let mut langs = Vec::new();
        if self.script.is_some() {
            langs.push(Language::Script);
        }
        if self.wasm.is_some() && self.wasm_ready {
            langs.push(Language::Wasm);
        }
        langs
    }

    /// Resolve the engine for a language, failing when it is not configured
    /// or not ready.
    pub fn resolve(&self, language: Language) -> Result<&Engine, GatewayError> {
        match language {
            Language::Script => self.script.as_ref().ok_or_else(|| {
                GatewayError::Internal(anyhow::anyhow!("script engine is not configured"))
            }),
            Language::Wasm => {
                let engine = self.wasm.as_ref().ok_or_else(|| {
                    GatewayError::Internal(anyhow::anyhow!("wasm engine is not configured"))
                })?;
                if !self.wasm_ready {
                    return Err(GatewayError::Internal(anyhow::anyhow!(
                        "wasm engine is configured but not marked ready"
                    )));
                }
                Ok(engine)
            }
        }
    }
}
