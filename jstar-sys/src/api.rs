//! The embedding API: how a host pushes and inspects values, calls into the
//! VM, registers natives, and evaluates compiled code. Natives address their
//! arguments through the same slot scheme: slot 0 is the receiver/callee,
//! positive slots count up through the arguments, negative slots count down
//! from the top of the stack.

use crate::buffer::Buffer;
use crate::vm::heap::{ClosureData, NativeData, NativeFn, ObjKind, ObjRef};
use crate::vm::value::Value;
use crate::vm::{JStarResult, Raised, Stack, VirtualMachine};

impl VirtualMachine {
    // ===== Typed pushes ===== //

    pub fn push_null(&mut self) {
        self.push(Value::Null);
    }

    pub fn push_bool(&mut self, b: bool) {
        self.push(Value::Bool(b));
    }

    pub fn push_num(&mut self, n: f64) {
        self.push(Value::Num(n));
    }

    pub fn push_handle(&mut self, h: u64) {
        self.push(Value::Handle(h));
    }

    pub fn push_str(&mut self, s: &str) {
        let r = self.intern(s);
        self.push(Value::Obj(r));
    }

    pub fn push_list(&mut self) {
        let l = self.alloc(self.builtins.list, ObjKind::List(Vec::new()));
        self.push(Value::Obj(l));
    }

    /// Pops the top of the stack and appends it to the list at `slot`.
    pub fn list_append(&mut self, slot: isize) {
        let l = self.get_slot(slot).as_obj();
        let v = self.pop();
        self.heap.as_list_mut(l).push(v);
    }

    /// Interns the buffer's contents and pushes the resulting String. The
    /// buffer is consumed; to keep building, start a new one.
    pub fn push_buffer(&mut self, buf: Buffer) {
        let r = self.intern(buf.as_str());
        self.push(Value::Obj(r));
    }

    // ===== Slot access ===== //

    fn slot_index(&self, slot: isize) -> usize {
        if slot < 0 {
            self.stack.len() - (-slot) as usize
        } else {
            self.api_base + slot as usize
        }
    }

    pub fn get_slot(&self, slot: isize) -> Value {
        self.stack[self.slot_index(slot)]
    }

    pub fn is_null_at(&self, slot: isize) -> bool {
        self.get_slot(slot).is_null()
    }

    pub fn is_bool_at(&self, slot: isize) -> bool {
        self.get_slot(slot).is_bool()
    }

    pub fn is_num_at(&self, slot: isize) -> bool {
        self.get_slot(slot).is_num()
    }

    pub fn is_str_at(&self, slot: isize) -> bool {
        matches!(self.get_slot(slot), Value::Obj(r) if self.heap.is_str(r))
    }

    pub fn is_list_at(&self, slot: isize) -> bool {
        matches!(self.get_slot(slot), Value::Obj(r) if self.heap.is_list(r))
    }

    pub fn is_tuple_at(&self, slot: isize) -> bool {
        matches!(self.get_slot(slot), Value::Obj(r) if self.heap.is_tuple(r))
    }

    /// Checked argument accessors for natives; a mismatch raises
    /// `TypeException` naming the argument.
    pub fn check_num_arg(&mut self, slot: isize, name: &str) -> Result<f64, Raised> {
        match self.get_slot(slot) {
            Value::Num(n) => Ok(n),
            v => {
                let t = self.type_name(v);
                Err(self.raise("TypeException", &format!("{} must be a Number, got {}.", name, t)))
            }
        }
    }

    pub fn check_str_arg(&mut self, slot: isize, name: &str) -> Result<String, Raised> {
        match self.get_slot(slot) {
            Value::Obj(r) if self.heap.is_str(r) => Ok(self.heap.as_str(r).to_string()),
            v => {
                let t = self.type_name(v);
                Err(self.raise("TypeException", &format!("{} must be a String, got {}.", name, t)))
            }
        }
    }

    pub fn check_int_arg(&mut self, slot: isize, name: &str) -> Result<i64, Raised> {
        match self.get_slot(slot) {
            Value::Num(n) if n.trunc() == n => Ok(n as i64),
            v => {
                let t = self.type_name(v);
                Err(self.raise("TypeException", &format!("{} must be an integer, got {}.", name, t)))
            }
        }
    }

    /// Elements of the list or tuple value, for hosts that want to walk a
    /// sequence without going through the iteration protocol.
    pub fn sequence_values(&self, v: Value) -> Option<Vec<Value>> {
        match v {
            Value::Obj(r) if self.heap.is_list(r) => Some(self.heap.as_list(r).clone()),
            Value::Obj(r) if self.heap.is_tuple(r) => Some(self.heap.as_tuple(r).to_vec()),
            _ => None,
        }
    }

    /// The string contents of a String value.
    pub fn str_value(&self, v: Value) -> Option<String> {
        match v {
            Value::Obj(r) if self.heap.is_str(r) => Some(self.heap.as_str(r).to_string()),
            _ => None,
        }
    }

    pub fn main_module(&self) -> ObjRef {
        self.main_module
    }

    // ===== Calls ===== //

    /// Calls the value at `stack[top - argc]` with the `argc` arguments
    /// above it. On success the return value replaces callee and arguments;
    /// on failure the raised exception is left on the stack.
    pub fn call(&mut self, argc: u8) -> JStarResult {
        let depth = self.frames.len();
        let callee = *self.peek(argc as usize);
        if self.call_value(callee, argc).is_err() {
            return JStarResult::RuntimeErr;
        }
        match self.run_until(depth) {
            Ok(()) => JStarResult::Success,
            Err(_) => JStarResult::RuntimeErr,
        }
    }

    /// Invokes `name` on the receiver at `stack[top - argc]`.
    pub fn invoke(&mut self, name: &str, argc: u8) -> JStarResult {
        let depth = self.frames.len();
        let n = self.intern(name);
        if self.invoke_value(n, argc).is_err() {
            return JStarResult::RuntimeErr;
        }
        match self.run_until(depth) {
            Ok(()) => JStarResult::Success,
            Err(_) => JStarResult::RuntimeErr,
        }
    }

    // ===== Globals and natives ===== //

    pub fn find_module(&mut self, name: &str) -> Option<ObjRef> {
        let n = self.intern(name);
        self.modules.get(&n).copied()
    }

    /// Pops the top of the stack and binds it as `name` in the named
    /// module's globals (the main module when the name is unknown).
    pub fn define_global(&mut self, module: &str, name: &str) {
        let m = self.find_module(module).unwrap_or(self.main_module);
        let n = self.intern(name);
        let v = self.pop();
        self.heap.as_module_mut(m).globals.put(n, v);
    }

    pub fn get_global(&mut self, module: &str, name: &str) -> Option<Value> {
        let m = self.find_module(module)?;
        let n = self.intern(name);
        self.heap.as_module(m).globals.get(n)
    }

    /// Registers a native symbol for resolution by the `Native` and
    /// `NatMethod` opcodes of the named module: free functions register with
    /// `class = None`, methods with the class name.
    pub fn register_native(&mut self, module: &str, class: Option<&str>, name: &str, fun: NativeFn) {
        self.natives
            .insert((String::from(module), class.map(String::from), String::from(name)), fun);
    }

    /// Creates a resolved native function and binds it directly into the
    /// named module's globals, the way hosts expose ad-hoc helpers.
    pub fn define_native(&mut self, module: &str, name: &str, arity: u8, vararg: bool, fun: NativeFn) {
        let m = self.find_module(module).unwrap_or(self.main_module);
        let native = self.alloc(
            self.builtins.function,
            ObjKind::Native(NativeData {
                name: String::from(name),
                module: m,
                arity,
                vararg,
                defaults: Vec::new(),
                fun: Some(fun),
            }),
        );
        self.push(Value::Obj(native));
        let n = self.intern(name);
        let v = self.pop();
        self.heap.as_module_mut(m).globals.put(n, v);
    }

    // ===== Evaluation ===== //

    /// Executes a compiled top-level function. Uncaught exceptions are
    /// delivered to the error callback and the VM is reset to an idle state.
    pub fn eval_function(&mut self, fun: ObjRef) -> JStarResult {
        self.push(Value::Obj(fun));
        self.eval_pushed()
    }

    /// Compiles `src` in the named module through the compiler seam, then
    /// executes it. Compile failures go to the error callback and never
    /// raise in-language exceptions.
    pub fn eval_string(&mut self, module: &str, src: &str) -> JStarResult {
        let mut compiler = match self.compiler.take() {
            Some(c) => c,
            None => {
                self.report_error(JStarResult::CompileErr, module, "no compiler installed");
                return JStarResult::CompileErr;
            }
        };
        let n = self.intern(module);
        if !self.modules.contains_key(&n) {
            self.new_module(n);
        }
        let result = compiler(self, module, src);
        self.compiler = Some(compiler);
        match result {
            Ok(fun) => {
                self.push(Value::Obj(fun));
                self.eval_pushed()
            }
            Err(msg) => {
                self.report_error(JStarResult::CompileErr, module, &msg);
                JStarResult::CompileErr
            }
        }
    }

    fn eval_pushed(&mut self) -> JStarResult {
        let f = self.peek(0).as_obj();
        let c = self.alloc(
            self.builtins.function,
            ObjKind::Closure(ClosureData { fun: f, upvalues: Vec::new() }),
        );
        let top = self.stack.len() - 1;
        self.stack[top] = Value::Obj(c);

        let depth = self.frames.len();
        if self.call_function(c, 0).is_err() {
            self.deliver_uncaught();
            return JStarResult::RuntimeErr;
        }
        if self.run_eval(depth) {
            self.pop();
            JStarResult::Success
        } else {
            self.deliver_uncaught();
            JStarResult::RuntimeErr
        }
    }

    pub(crate) fn report_error(&mut self, result: JStarResult, source: &str, msg: &str) {
        if let Some(mut cb) = self.error_callback.take() {
            cb(result, source, msg);
            self.error_callback = Some(cb);
        }
    }

    /// Formats the pending exception for the error callback, then resets the
    /// stacks so the VM stays usable.
    fn deliver_uncaught(&mut self) {
        let msg = self.format_uncaught();
        let source = self.heap.as_str(self.heap.as_module(self.module).name).to_string();
        self.report_error(JStarResult::RuntimeErr, &source, &msg);

        self.close_upvalues(0);
        self.stack.clear();
        self.frames.clear();
        self.api_base = 0;
        self.module = self.main_module;
    }
}


#[cfg(test)]
mod test {
    use std::sync::{Arc, Mutex};

    use crate::buffer::Buffer;
    use crate::vm::builder::FunctionBuilder;
    use crate::vm::opcode::Opcode;
    use crate::vm::operator::BinaryOp;
    use crate::vm::value::Value;
    use crate::vm::{Config, JStarResult, Stack, VirtualMachine};

    fn new_vm() -> VirtualMachine {
        VirtualMachine::new(Config::default())
    }

    #[test]
    fn test_typed_pushes_and_negative_slots() {
        let mut vm = new_vm();
        vm.push_num(1.5);
        vm.push_bool(true);
        vm.push_str("hey");
        assert!(vm.is_str_at(-1));
        assert!(vm.is_bool_at(-2));
        assert!(vm.is_num_at(-3));
        assert_eq!(Some(String::from("hey")), vm.str_value(vm.get_slot(-1)));
        vm.pop();
        vm.pop();
        assert_eq!(Value::Num(1.5), vm.pop());
    }

    #[test]
    fn test_call_from_host() {
        let mut vm = new_vm();
        let main = vm.main_module();

        let mut add = FunctionBuilder::new("add");
        add.arity = 2;
        add.op(Opcode::GetLocal(1))
            .op(Opcode::GetLocal(2))
            .op(Opcode::Binary(BinaryOp::Add))
            .op(Opcode::Return);

        let mut program = FunctionBuilder::new("<setup>");
        let add_c = program.fun_const(add);
        let c_add = program.str_const("add");
        program.op(Opcode::NewClosure(add_c))
            .op(Opcode::DefineGlobal(c_add))
            .op(Opcode::Null)
            .op(Opcode::Return);

        let fun = program.build(&mut vm, main);
        vm.pop();
        assert_eq!(JStarResult::Success, vm.eval_function(fun));

        let add = vm.get_global("__main__", "add").unwrap();
        vm.push(add);
        vm.push_num(1.0);
        vm.push_num(2.0);
        assert_eq!(JStarResult::Success, vm.call(2));
        assert_eq!(Value::Num(3.0), vm.pop());
    }

    #[test]
    fn test_invoke_from_host() {
        let mut vm = new_vm();
        vm.push_list();
        vm.push_num(5.0);
        assert_eq!(JStarResult::Success, vm.invoke("append", 1));
        let list = vm.pop();
        assert_eq!(vec![Value::Num(5.0)], vm.sequence_values(list).unwrap());
    }

    #[test]
    fn test_invoke_error_leaves_exception() {
        let mut vm = new_vm();
        vm.push_num(1.0);
        assert_eq!(JStarResult::RuntimeErr, vm.invoke("nope", 0));
        // The raised exception is on the stack for inspection.
        let exc = vm.pop();
        assert_eq!("MethodException", vm.type_name(exc));
    }

    #[test]
    fn test_buffer_becomes_interned_string() {
        let mut vm = new_vm();
        let mut buf = Buffer::new();
        buf.append_str("bu");
        buf.append_char('f');
        vm.push_buffer(buf);
        assert!(vm.is_str_at(-1));
        let v = vm.pop();
        assert_eq!(Value::Obj(vm.intern("buf")), v);
    }

    #[test]
    fn test_uncaught_error_reaches_callback_and_vm_recovers() {
        let seen: Arc<Mutex<Vec<(JStarResult, String)>>> = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let config = Config {
            error_callback: Some(Box::new(move |result, _source, msg| {
                sink.lock().unwrap().push((result, String::from(msg)));
            })),
            ..Config::default()
        };
        let mut vm = VirtualMachine::new(config);
        let main = vm.main_module();

        let mut bad = FunctionBuilder::new("<main>");
        let missing = bad.str_const("missing");
        bad.op(Opcode::GetGlobal(missing)).op(Opcode::Return);
        let fun = bad.build(&mut vm, main);
        vm.pop();
        assert_eq!(JStarResult::RuntimeErr, vm.eval_function(fun));

        {
            let seen = seen.lock().unwrap();
            assert_eq!(1, seen.len());
            assert_eq!(JStarResult::RuntimeErr, seen[0].0);
            assert!(seen[0].1.contains("NameException"), "{}", seen[0].1);
        }

        // The VM is reset and usable after delivery.
        let mut ok = FunctionBuilder::new("<main>");
        let one = ok.num_const(1.0);
        ok.op(Opcode::Constant(one)).op(Opcode::Return);
        let fun = ok.build(&mut vm, main);
        vm.pop();
        assert_eq!(JStarResult::Success, vm.eval_function(fun));
    }

    #[test]
    fn test_eval_string_without_compiler() {
        let seen: Arc<Mutex<Vec<JStarResult>>> = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let config = Config {
            error_callback: Some(Box::new(move |result, _source, _msg| {
                sink.lock().unwrap().push(result);
            })),
            ..Config::default()
        };
        let mut vm = VirtualMachine::new(config);
        assert_eq!(JStarResult::CompileErr, vm.eval_string("__main__", "1 + 1"));
        assert_eq!(vec![JStarResult::CompileErr], *seen.lock().unwrap());
    }

    #[test]
    fn test_eval_string_through_compiler_seam() {
        // A stand-in front-end: whatever the source, compile a unit that
        // defines `answer = 42` in the target module.
        let config = Config {
            compiler: Some(Box::new(|vm, module, _src| {
                let m = vm.find_module(module).expect("module pre-created");
                let mut b = FunctionBuilder::new("<eval>");
                let answer = b.num_const(42.0);
                let c_answer = b.str_const("answer");
                b.op(Opcode::Constant(answer))
                    .op(Opcode::DefineGlobal(c_answer))
                    .op(Opcode::Null)
                    .op(Opcode::Return);
                let fun = b.build(vm, m);
                vm.pop();
                Ok(fun)
            })),
            ..Config::default()
        };
        let mut vm = VirtualMachine::new(config);
        assert_eq!(JStarResult::Success, vm.eval_string("scratch", "answer = 42"));
        assert_eq!(Some(Value::Num(42.0)), vm.get_global("scratch", "answer"));
    }
}
