use std::rc::Rc;

use crate::vm::heap::{FunData, FunProto, NativeData, ObjKind, ObjRef};
use crate::vm::opcode::Opcode;
use crate::vm::value::Value;
use crate::vm::{Stack, VirtualMachine};

/// A constant-pool entry before materialization. Nested functions are built
/// recursively, so a whole compilation unit assembles in one pass. Native
/// constants materialize unresolved; the `Native`/`NatMethod` opcodes bind
/// their host function from the registration table.
pub enum Const {
    Null,
    True,
    False,
    Num(f64),
    Str(String),
    Fun(FunctionBuilder),
    Native { name: String, arity: u8, vararg: bool },
}

/// Programmatic assembler for `Function` objects: the shape a front-end (or
/// a test) hands to the runtime. Instructions carry the current source line,
/// set with [`FunctionBuilder::line`].
///
/// Functions that will be defined as methods must reserve constant slot 0
/// (conventionally with `Const::Null`): `DefMethod` stores the defining
/// class's superclass there for `super` dispatch.
pub struct FunctionBuilder {
    pub name: String,
    pub arity: u8,
    pub vararg: bool,
    defaults: Vec<Const>,
    consts: Vec<Const>,
    code: Vec<Opcode>,
    lines: Vec<u32>,
    cur_line: u32,
}

impl FunctionBuilder {
    pub fn new(name: &str) -> FunctionBuilder {
        FunctionBuilder {
            name: String::from(name),
            arity: 0,
            vararg: false,
            defaults: Vec::new(),
            consts: Vec::new(),
            code: Vec::new(),
            lines: Vec::new(),
            cur_line: 1,
        }
    }

    pub fn line(&mut self, line: u32) -> &mut FunctionBuilder {
        self.cur_line = line;
        self
    }

    pub fn op(&mut self, op: Opcode) -> &mut FunctionBuilder {
        self.code.push(op);
        self.lines.push(self.cur_line);
        self
    }

    pub fn add_const(&mut self, c: Const) -> u16 {
        self.consts.push(c);
        (self.consts.len() - 1) as u16
    }

    pub fn str_const(&mut self, s: &str) -> u16 {
        self.add_const(Const::Str(String::from(s)))
    }

    pub fn num_const(&mut self, n: f64) -> u16 {
        self.add_const(Const::Num(n))
    }

    pub fn fun_const(&mut self, b: FunctionBuilder) -> u16 {
        self.add_const(Const::Fun(b))
    }

    pub fn add_default(&mut self, c: Const) {
        self.defaults.push(c);
    }

    /// Materializes the function into the heap and leaves it on the operand
    /// stack, the same contract a compile has: the caller wraps it in a
    /// closure or serializes it from there.
    pub fn build(&self, vm: &mut VirtualMachine, module: ObjRef) -> ObjRef {
        let mark = vm.temp_roots.len();
        let fun = self.build_inner(vm, module);
        vm.push(Value::Obj(fun));
        vm.temp_roots.truncate(mark);
        fun
    }

    /// Builds without pushing; the result is kept alive through the VM's
    /// construction roots until the outermost `build` truncates them.
    fn build_inner(&self, vm: &mut VirtualMachine, module: ObjRef) -> ObjRef {
        let mut consts = Vec::with_capacity(self.consts.len());
        for c in &self.consts {
            consts.push(materialize(vm, c, module));
        }
        let mut defaults = Vec::with_capacity(self.defaults.len());
        for d in &self.defaults {
            defaults.push(materialize(vm, d, module));
        }

        let proto = Rc::new(FunProto {
            name: self.name.clone(),
            arity: self.arity,
            vararg: self.vararg,
            code: self.code.clone(),
            lines: self.lines.clone(),
        });
        let f = vm.alloc(vm.builtins.function, ObjKind::Fun(FunData { proto, consts, defaults, module }));
        vm.temp_roots.push(f);
        f
    }
}

fn materialize(vm: &mut VirtualMachine, c: &Const, module: ObjRef) -> Value {
    match c {
        Const::Null => Value::Null,
        Const::True => Value::Bool(true),
        Const::False => Value::Bool(false),
        Const::Num(n) => Value::Num(*n),
        Const::Str(s) => {
            let r = vm.intern(s);
            vm.temp_roots.push(r);
            Value::Obj(r)
        }
        Const::Fun(b) => Value::Obj(b.build_inner(vm, module)),
        Const::Native { name, arity, vararg } => {
            let n = vm.alloc(
                vm.builtins.function,
                ObjKind::Native(NativeData {
                    name: name.clone(),
                    module,
                    arity: *arity,
                    vararg: *vararg,
                    defaults: Vec::new(),
                    fun: None,
                }),
            );
            vm.temp_roots.push(n);
            Value::Obj(n)
        }
    }
}
