//! Configuration for the code generator
//!
//! Limits and output options that the lowering routines consult. The defaults
//! match the stock Lua 5.3 virtual machine.

/// Registers available in one VM call frame
pub const DEFAULT_MAX_REGISTERS: usize = 255;

/// Largest constant index an RK operand can encode
pub const DEFAULT_RK_MAX_CONSTANT: usize = 0xFF;

/// Code generator configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompilerConfig {
    /// Source name recorded in the main prototype
    pub chunk_name: String,

    /// Maximum number of simultaneously live registers per function
    pub max_registers: usize,

    /// Largest constant index usable directly as an RK operand; larger
    /// indexes are loaded into a register first
    pub rk_max_constant: usize,

    /// Omit line info, local names and upvalue names from prototypes
    pub strip_debug: bool,
}

impl Default for CompilerConfig {
    fn default() -> Self {
        CompilerConfig {
            chunk_name: "=?".to_string(),
            max_registers: DEFAULT_MAX_REGISTERS,
            rk_max_constant: DEFAULT_RK_MAX_CONSTANT,
            strip_debug: false,
        }
    }
}

impl CompilerConfig {
    /// Create a configuration with default settings
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the chunk name
    pub fn with_chunk_name(mut self, name: impl Into<String>) -> Self {
        self.chunk_name = name.into();
        self
    }

    /// Set the per-function register limit (clamped to the A field width)
    pub fn with_max_registers(mut self, limit: usize) -> Self {
        self.max_registers = limit.min(DEFAULT_MAX_REGISTERS);
        self
    }

    /// Set the largest constant index usable as an RK operand
    pub fn with_rk_max_constant(mut self, limit: usize) -> Self {
        self.rk_max_constant = limit.min(DEFAULT_RK_MAX_CONSTANT);
        self
    }

    /// Strip debug information from the output
    pub fn with_strip_debug(mut self, strip: bool) -> Self {
        self.strip_debug = strip;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_and_clamping() {
        let config = CompilerConfig::default();
        assert_eq!(config.max_registers, 255);
        assert_eq!(config.rk_max_constant, 0xFF);
        assert!(!config.strip_debug);

        let config = CompilerConfig::new()
            .with_chunk_name("@script.lua")
            .with_max_registers(1000)
            .with_rk_max_constant(4);
        assert_eq!(config.chunk_name, "@script.lua");
        assert_eq!(config.max_registers, 255);
        assert_eq!(config.rk_max_constant, 4);
    }
}
