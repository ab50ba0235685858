//! Module loading: registry lookup, import-path resolution, and the
//! execution contract of the `Import*` opcodes.
//!
//! Resolution tries, for each import-path prefix, a pre-compiled `.jsb`
//! file first and then a `.jsr` source file, which requires the compiler
//! seam. A dotted module name maps onto nested directories. The first import
//! leaves the module's top-level function in execution; re-imports bind the
//! registered module and push `null` to signal that nothing ran.

use std::fs;
use std::path::PathBuf;

use crate::vm::heap::{ClosureData, ModuleData, ObjKind, ObjRef};
use crate::vm::serialize;
use crate::vm::table::Table;
use crate::vm::value::Value;
use crate::vm::{JStarResult, Raised, Stack, VirtualMachine};

impl VirtualMachine {
    pub fn add_import_path(&mut self, path: impl Into<PathBuf>) {
        self.import_paths.push(path.into());
    }

    /// Creates and registers an empty module seeded with the core globals
    /// (every non-underscore name the core module exports).
    pub(crate) fn new_module(&mut self, name: ObjRef) -> ObjRef {
        let m = self.alloc(
            self.builtins.module,
            ObjKind::Module(ModuleData { name, globals: Table::new() }),
        );
        let pairs: Vec<(ObjRef, Value)> = self
            .heap
            .as_module(self.core_module)
            .globals
            .iter()
            .filter(|(k, _)| !self.heap.as_str(*k).starts_with('_'))
            .collect();
        for (k, v) in pairs {
            self.heap.as_module_mut(m).globals.put(k, v);
        }
        self.modules.insert(name, m);
        m
    }

    /// Resolves and loads a module by interned name. Leaves the module's
    /// top-level function on the stack on first load, or `null` when the
    /// module was already registered.
    pub(crate) fn import_module(&mut self, name: ObjRef) -> Result<(), Raised> {
        if self.modules.contains_key(&name) {
            self.push(Value::Null);
            return Ok(());
        }

        let name_str = self.heap.as_str(name).to_string();
        let rel: PathBuf = name_str.split('.').collect();

        for dir in self.import_paths.clone() {
            let compiled = dir.join(&rel).with_extension("jsb");
            if compiled.is_file() {
                let bytes = match fs::read(&compiled) {
                    Ok(b) => b,
                    Err(e) => {
                        return Err(self.raise(
                            "ImportException",
                            &format!("Cannot read module file `{}`: {}.", compiled.display(), e),
                        ))
                    }
                };
                let module = self.new_module(name);
                return match serialize::deserialize_function(self, &bytes, module) {
                    // The top-level function is left on the stack.
                    Ok(_) => Ok(()),
                    Err(e) => {
                        self.modules.shift_remove(&name);
                        Err(self.raise(
                            "ImportException",
                            &format!("Cannot load module `{}`: {}.", name_str, e),
                        ))
                    }
                };
            }

            let source = dir.join(&rel).with_extension("jsr");
            if source.is_file() {
                let mut compiler = match self.compiler.take() {
                    Some(c) => c,
                    None => {
                        return Err(self.raise(
                            "ImportException",
                            &format!("Cannot load module `{}`: no compiler installed.", name_str),
                        ))
                    }
                };
                let src = match fs::read_to_string(&source) {
                    Ok(s) => s,
                    Err(e) => {
                        self.compiler = Some(compiler);
                        return Err(self.raise(
                            "ImportException",
                            &format!("Cannot read module file `{}`: {}.", source.display(), e),
                        ));
                    }
                };
                let module = self.new_module(name);
                let result = compiler(self, &name_str, &src);
                self.compiler = Some(compiler);
                return match result {
                    Ok(fun) => {
                        debug_assert!(self.heap.as_fun(fun).module == module);
                        self.push(Value::Obj(fun));
                        Ok(())
                    }
                    Err(msg) => {
                        self.modules.shift_remove(&name);
                        self.report_error(JStarResult::CompileErr, &name_str, &msg);
                        Err(self.raise(
                            "ImportException",
                            &format!("Cannot load module `{}`.", name_str),
                        ))
                    }
                };
            }
        }

        Err(self.raise("ImportException", &format!("Cannot load module `{}`.", name_str)))
    }

    /// `Import` / `ImportAs`: load, bind the module object into the current
    /// module's globals, then start executing its top-level code on first
    /// load. One value is always left on the stack for the trailing `Pop`
    /// the compiler emits.
    pub(crate) fn op_import(&mut self, name: ObjRef, alias: Option<ObjRef>) -> Result<(), Raised> {
        self.import_module(name)?;
        let module_obj = *self.modules.get(&name).unwrap();
        let bind = alias.unwrap_or(name);
        let cur = self.module;
        self.heap.as_module_mut(cur).globals.put(bind, Value::Obj(module_obj));
        self.exec_module_init()
    }

    /// `ImportFrom`: load and execute, but bind nothing; the following
    /// `ImportName` opcodes copy individual names.
    pub(crate) fn op_import_from(&mut self, name: ObjRef) -> Result<(), Raised> {
        self.import_module(name)?;
        self.exec_module_init()
    }

    fn exec_module_init(&mut self) -> Result<(), Raised> {
        if self.peek(0).is_null() {
            return Ok(());
        }
        let f = self.peek(0).as_obj();
        let c = self.alloc(
            self.builtins.function,
            ObjKind::Closure(ClosureData { fun: f, upvalues: Vec::new() }),
        );
        let top = self.stack.len() - 1;
        self.stack[top] = Value::Obj(c);
        self.call_function(c, 0)
    }

    /// `ImportName`: copies `module.globals[name]` into the importing
    /// module, or every non-underscore binding when the name is `*`.
    pub(crate) fn op_import_name(&mut self, module_name: ObjRef, name: ObjRef) -> Result<(), Raised> {
        let m = *self.modules.get(&module_name).expect("ImportName before module load");
        if self.heap.as_str(name) == "*" {
            let pairs: Vec<(ObjRef, Value)> = self
                .heap
                .as_module(m)
                .globals
                .iter()
                .filter(|(k, _)| !self.heap.as_str(*k).starts_with('_'))
                .collect();
            let cur = self.module;
            for (k, v) in pairs {
                self.heap.as_module_mut(cur).globals.put(k, v);
            }
            return Ok(());
        }
        match self.heap.as_module(m).globals.get(name) {
            Some(v) => {
                let cur = self.module;
                self.heap.as_module_mut(cur).globals.put(name, v);
                Ok(())
            }
            None => {
                let n = self.heap.as_str(name).to_string();
                let mn = self.heap.as_str(self.heap.as_module(m).name).to_string();
                Err(self.raise(
                    "NameException",
                    &format!("Name `{}` not defined in module `{}`.", n, mn),
                ))
            }
        }
    }
}
