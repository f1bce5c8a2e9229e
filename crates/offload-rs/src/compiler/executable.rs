use std::fs;
use std::path::Path;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::backend::accelerator::ExternalModule;
use crate::backend::spec::{
    ElementwiseBinaryOp, ElementwiseUnaryOp, TensorLiteral, TensorSpec,
};
use crate::compiler::CompileError;
use crate::runtime::native::NativeModule;

/// Frozen bytecode format version.
pub const BYTECODE_VERSION: &str = "oexec.v1";

const CODE_FILE: &str = "code.bin";
const LIB_FILE: &str = "lib.json";

/// VM register index.
pub type Reg = u32;

/// Operators the VM evaluates on the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum HostOp {
    Binary(ElementwiseBinaryOp),
    Unary(ElementwiseUnaryOp),
    BiasAdd { axis: i64 },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Bytecode {
    LoadConst {
        dst: Reg,
        constant: usize,
    },
    InvokeHost {
        op: HostOp,
        args: Vec<Reg>,
        dst: Reg,
    },
    InvokeExternal {
        module: usize,
        args: Vec<Reg>,
        dsts: Vec<Reg>,
    },
    Ret {
        results: Vec<Reg>,
    },
}

/// Named entry input bound to a register.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InputSlot {
    pub name: String,
    pub spec: TensorSpec,
    pub reg: Reg,
}

/// Serialized half of an executable: bytecode plus constants.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutableCode {
    pub version: String,
    pub entry: String,
    pub inputs: Vec<InputSlot>,
    pub outputs: Vec<TensorSpec>,
    pub constants: Vec<TensorLiteral>,
    pub num_registers: u32,
    pub instructions: Vec<Bytecode>,
}

impl ExecutableCode {
    /// Rejects registers, constants or modules that point past the end of their tables.
    fn check_indices(&self, modules: usize) -> Result<(), CompileError> {
        let check_reg = |reg: &Reg| {
            if *reg < self.num_registers {
                Ok(())
            } else {
                Err(CompileError::Invalid(format!(
                    "register {reg} is out of range for {} registers",
                    self.num_registers
                )))
            }
        };
        for slot in &self.inputs {
            check_reg(&slot.reg)?;
        }
        for instruction in &self.instructions {
            match instruction {
                Bytecode::LoadConst { dst, constant } => {
                    check_reg(dst)?;
                    if *constant >= self.constants.len() {
                        return Err(CompileError::Invalid(format!(
                            "bytecode references constant {constant} but there are {}",
                            self.constants.len()
                        )));
                    }
                }
                Bytecode::InvokeHost { args, dst, .. } => {
                    args.iter().try_for_each(check_reg)?;
                    check_reg(dst)?;
                }
                Bytecode::InvokeExternal { module, args, dsts } => {
                    if *module >= modules {
                        return Err(CompileError::Invalid(format!(
                            "bytecode references module {module} but the library has {modules}"
                        )));
                    }
                    args.iter().chain(dsts).try_for_each(check_reg)?;
                }
                Bytecode::Ret { results } => results.iter().try_for_each(check_reg)?,
            }
        }
        Ok(())
    }
}

/// Library half of an executable: one module per partitioned region.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExternalLibrary {
    pub modules: Vec<ExternalModule>,
}

impl ExternalLibrary {
    pub fn module(&self, symbol: &str) -> Option<&ExternalModule> {
        self.modules.iter().find(|module| module.symbol == symbol)
    }

    pub fn is_empty(&self) -> bool {
        self.modules.is_empty()
    }

    pub fn to_json_string(&self) -> Result<String, CompileError> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn from_json_str(src: &str) -> Result<Self, CompileError> {
        Ok(serde_json::from_str(src)?)
    }

    pub fn save_json<P: AsRef<Path>>(&self, path: P) -> Result<(), CompileError> {
        fs::write(path, self.to_json_string()?)?;
        Ok(())
    }

    pub fn load_json<P: AsRef<Path>>(path: P) -> Result<Self, CompileError> {
        Self::from_json_str(&fs::read_to_string(path)?)
    }
}

/// Compiled program ready to be bound to a [`crate::runtime::VirtualMachine`].
#[derive(Debug, Clone)]
pub struct Executable {
    code: ExecutableCode,
    library: ExternalLibrary,
    native: Option<Arc<NativeModule>>,
}

impl Executable {
    pub(crate) fn new(code: ExecutableCode, library: ExternalLibrary) -> Self {
        Self {
            code,
            library,
            native: None,
        }
    }

    pub fn code(&self) -> &ExecutableCode {
        &self.code
    }

    pub fn library(&self) -> &ExternalLibrary {
        &self.library
    }

    pub fn native(&self) -> Option<&Arc<NativeModule>> {
        self.native.as_ref()
    }

    pub fn input_names(&self) -> Vec<&str> {
        self.code
            .inputs
            .iter()
            .map(|slot| slot.name.as_str())
            .collect()
    }

    /// Splits the executable into serialized bytecode and its library.
    pub fn save(&self) -> Result<(Vec<u8>, ExternalLibrary), CompileError> {
        let code = bincode::serialize(&self.code)?;
        Ok((code, self.library.clone()))
    }

    /// Rebuilds an executable from [`Executable::save`] output.
    pub fn load_exec(code: &[u8], library: ExternalLibrary) -> Result<Self, CompileError> {
        let code: ExecutableCode = bincode::deserialize(code)?;
        if code.version != BYTECODE_VERSION {
            return Err(CompileError::VersionMismatch {
                found: code.version,
                expected: BYTECODE_VERSION,
            });
        }
        code.check_indices(library.modules.len())?;
        Ok(Self::new(code, library))
    }

    /// Like [`Executable::load_exec`], but binds external calls to a compiled native shim.
    pub fn load_exec_native(
        code: &[u8],
        library: ExternalLibrary,
        native: NativeModule,
    ) -> Result<Self, CompileError> {
        let mut exec = Self::load_exec(code, library)?;
        for module in &exec.library.modules {
            native
                .entrypoint(&module.symbol)
                .map_err(|err| CompileError::Native(err.to_string()))?;
        }
        exec.native = Some(Arc::new(native));
        Ok(exec)
    }

    /// Writes `code.bin` and `lib.json` into `dir`.
    pub fn save_to_dir<P: AsRef<Path>>(&self, dir: P) -> Result<(), CompileError> {
        let dir = dir.as_ref();
        fs::create_dir_all(dir)?;
        let (code, library) = self.save()?;
        fs::write(dir.join(CODE_FILE), code)?;
        library.save_json(dir.join(LIB_FILE))
    }

    pub fn load_from_dir<P: AsRef<Path>>(dir: P) -> Result<Self, CompileError> {
        let dir = dir.as_ref();
        let code = fs::read(dir.join(CODE_FILE))?;
        let library = ExternalLibrary::load_json(dir.join(LIB_FILE))?;
        Self::load_exec(&code, library)
    }
}
