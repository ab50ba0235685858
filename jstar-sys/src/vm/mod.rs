use std::path::PathBuf;
use std::rc::Rc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use fxhash::{FxBuildHasher, FxHashMap};
use indexmap::IndexMap;
use itertools::Itertools;

use crate::core::{Builtins, Sym};
use crate::trace;
use crate::util::{is_int, num_to_str, OffsetAdd};
use crate::vm::heap::{
    BoundData, ClassData, ClosureData, FunProto, Heap, InstanceData, NativeFn, ObjKind, ObjRef,
    TraceLine, UpvalueState,
};
use crate::vm::opcode::Opcode;
use crate::vm::operator::{BinaryOp, UnaryOp};
use crate::vm::table::{Table, ValueMap};
use crate::vm::value::{UnwindCause, Value};

pub mod builder;
pub mod heap;
pub mod import;
pub mod opcode;
pub mod operator;
pub mod serialize;
pub mod table;
pub mod value;

/// Maximum call-frame depth; exceeding it raises `StackOverflowException`.
pub const RECURSION_LIMIT: usize = 1000;

/// Maximum number of simultaneously installed handlers per frame. The
/// compiler bounds `try` nesting, so hitting this at runtime means the
/// bytecode was not produced by a conforming front-end.
pub const HANDLER_MAX: usize = 10;

/// Marker for "an exception has been raised and is pending on the stack".
/// Fallible runtime operations return `Result<(), Raised>`; the dispatch
/// loop converts `Err` into stack unwinding.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub struct Raised;

/// Outcome of a host-facing evaluation.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum JStarResult {
    Success,
    SyntaxErr,
    CompileErr,
    RuntimeErr,
    IoErr,
}

impl JStarResult {
    pub fn exit_code(self) -> i32 {
        match self {
            JStarResult::Success => 0,
            JStarResult::SyntaxErr => 1,
            JStarResult::CompileErr => 2,
            JStarResult::RuntimeErr => 3,
            JStarResult::IoErr => 4,
        }
    }
}

/// Receives compile errors and uncaught runtime exceptions:
/// `(result, module-or-file, formatted message)`.
pub type ErrorCallback = Box<dyn FnMut(JStarResult, &str, &str)>;

/// The compiler seam. The front-end is an external collaborator: given a
/// module name and source text it produces a compiled function object (or an
/// error message) without executing anything. The function is returned
/// unrooted; callers push it before the next allocation.
pub type CompilerFn = Box<dyn FnMut(&mut VirtualMachine, &str, &str) -> Result<ObjRef, String>>;

/// VM construction parameters.
pub struct Config {
    /// Initial operand-stack capacity, in value cells.
    pub stack_size: usize,
    /// Heap bytes before the first collection.
    pub init_gc: usize,
    /// Multiplier applied to the live-byte count to choose the next
    /// collection threshold. Clamped to at least 2.
    pub heap_grow_rate: usize,
    pub error_callback: Option<ErrorCallback>,
    pub compiler: Option<CompilerFn>,
}

impl Default for Config {
    fn default() -> Config {
        Config {
            stack_size: 2048,
            init_gc: 1024 * 1024,
            heap_grow_rate: 2,
            error_callback: None,
            compiler: None,
        }
    }
}

#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub(crate) enum HandlerKind {
    Except,
    Ensure,
}

/// Where to resume, and with what stack height, when an exception or a
/// return passes through a `try` block installed in this frame.
#[derive(Copy, Clone, Debug)]
pub(crate) struct Handler {
    kind: HandlerKind,
    target: usize,
    saved_sp: usize,
}

/// Activation record of one in-flight call. `base` indexes the callee slot;
/// parameters and locals occupy ascending slots above it.
pub(crate) struct Frame {
    ip: usize,
    base: usize,
    /// The bound callable: a Closure for script calls, a Native for host
    /// calls.
    fun: ObjRef,
    handlers: Vec<Handler>,
}

pub struct VirtualMachine {
    pub(crate) stack: Vec<Value>,
    pub(crate) frames: Vec<Frame>,
    pub(crate) heap: Heap,

    /// Loaded modules: interned name to module object.
    pub(crate) modules: IndexMap<ObjRef, ObjRef, FxBuildHasher>,
    pub(crate) import_paths: Vec<PathBuf>,

    /// Open upvalues, sorted by descending stack slot.
    open_upvalues: Vec<ObjRef>,

    pub(crate) builtins: Builtins,
    /// Cached interned method names, indexed by `Sym`.
    syms: Vec<ObjRef>,

    /// The module whose globals unqualified names resolve against.
    pub(crate) module: ObjRef,
    pub(crate) core_module: ObjRef,
    pub(crate) main_module: ObjRef,

    /// Base of the executing native's stack window; embedding-API slots are
    /// relative to it.
    pub(crate) api_base: usize,

    /// Set asynchronously (signal handler, other thread) to interrupt
    /// evaluation at the next safe point.
    eval_break: Arc<AtomicBool>,

    /// Host-registered native symbols: (module, class, name) to function.
    pub(crate) natives: FxHashMap<(String, Option<String>, String), NativeFn>,
    pub(crate) compiler: Option<CompilerFn>,
    pub(crate) error_callback: Option<ErrorCallback>,

    /// Roots for objects under construction by the builder or the bytecode
    /// loader, which are not yet reachable from anywhere else.
    pub(crate) temp_roots: Vec<ObjRef>,

    bootstrapping: bool,
}

/// Operand-stack primitives shared by the dispatch loop, natives and the
/// embedding API.
pub trait Stack {
    fn peek(&self, offset: usize) -> &Value;
    fn pop(&mut self) -> Value;
    fn push(&mut self, value: Value);
}

impl Stack for VirtualMachine {
    fn peek(&self, offset: usize) -> &Value {
        &self.stack[self.stack.len() - 1 - offset]
    }

    fn pop(&mut self) -> Value {
        trace::trace_interpreter_stack!("pop() <- [{}]", self.stack.iter().rev().map(|t| format!("{:?}", t)).join(", "));
        self.stack.pop().unwrap()
    }

    fn push(&mut self, value: Value) {
        trace::trace_interpreter_stack!("push({:?})", value);
        self.stack.push(value);
    }
}

impl VirtualMachine {
    pub fn new(config: Config) -> VirtualMachine {
        let mut vm = VirtualMachine {
            stack: Vec::with_capacity(config.stack_size),
            frames: Vec::new(),
            heap: Heap::new(config.init_gc, config.heap_grow_rate),
            modules: IndexMap::default(),
            import_paths: Vec::new(),
            open_upvalues: Vec::new(),
            builtins: Builtins::placeholder(),
            syms: Vec::new(),
            module: ObjRef::from_index(0),
            core_module: ObjRef::from_index(0),
            main_module: ObjRef::from_index(0),
            api_base: 0,
            eval_break: Arc::new(AtomicBool::new(false)),
            natives: FxHashMap::default(),
            compiler: config.compiler,
            error_callback: config.error_callback,
            temp_roots: Vec::new(),
            bootstrapping: true,
        };
        crate::core::bootstrap(&mut vm);
        vm.bootstrapping = false;
        vm
    }

    // ===== Allocation and interning ===== //

    /// Allocates a heap object, first collecting garbage when the byte
    /// threshold has been crossed. Every intermediate object a caller holds
    /// across this call must be reachable from a root.
    pub(crate) fn alloc(&mut self, class: ObjRef, kind: ObjKind) -> ObjRef {
        if !self.bootstrapping && (self.heap.stress || self.heap.allocated >= self.heap.next_gc) {
            self.collect_garbage();
        }
        self.heap.raw_alloc(class, kind)
    }

    /// Returns the canonical string object for `s`, creating it on first
    /// use. For any byte sequence at most one live string exists, so interned
    /// strings compare by handle.
    pub fn intern(&mut self, s: &str) -> ObjRef {
        if let Some(&r) = self.heap.strings.get(s) {
            return r;
        }
        let data: Rc<str> = Rc::from(s);
        let class = self.builtins.string;
        let r = self.alloc(class, ObjKind::Str(data.clone()));
        self.heap.strings.insert(data, r);
        r
    }

    pub(crate) fn sym(&self, s: Sym) -> ObjRef {
        self.syms[s as usize]
    }

    pub(crate) fn set_syms(&mut self, syms: Vec<ObjRef>) {
        self.syms = syms;
    }

    // ===== Garbage collection ===== //

    /// Stop-the-world mark-sweep over every root the mutator holds.
    pub fn collect_garbage(&mut self) {
        let VirtualMachine {
            heap,
            stack,
            frames,
            open_upvalues,
            modules,
            builtins,
            syms,
            temp_roots,
            module,
            core_module,
            main_module,
            ..
        } = self;

        for v in stack.iter() {
            heap.mark_value(v);
        }
        for f in frames.iter() {
            heap.mark_obj(f.fun);
        }
        for &r in open_upvalues.iter() {
            heap.mark_obj(r);
        }
        for (&k, &v) in modules.iter() {
            heap.mark_obj(k);
            heap.mark_obj(v);
        }
        for &r in builtins.all().iter() {
            heap.mark_obj(r);
        }
        for &r in syms.iter() {
            heap.mark_obj(r);
        }
        for &r in temp_roots.iter() {
            heap.mark_obj(r);
        }
        heap.mark_obj(*module);
        heap.mark_obj(*core_module);
        heap.mark_obj(*main_module);

        heap.trace_references();
        heap.sweep_strings();
        heap.sweep();
        heap.next_gc = (heap.allocated * heap.grow_rate).max(1024);
    }

    // ===== Classification ===== //

    pub fn class_of(&self, v: Value) -> ObjRef {
        match v {
            Value::Num(_) => self.builtins.number,
            Value::Bool(_) => self.builtins.boolean,
            Value::Obj(r) => self.heap.class_of_obj(r),
            Value::Null | Value::Handle(_) | Value::Cause(_) => self.builtins.null,
        }
    }

    pub fn type_name(&self, v: Value) -> String {
        self.heap.as_class(self.class_of(v)).name.clone()
    }

    /// Walks the superclass chain of `class_of(v)` looking for `cls`.
    pub fn is_instance(&self, v: Value, cls: ObjRef) -> bool {
        let mut cur = Some(self.class_of(v));
        while let Some(c) = cur {
            if c == cls {
                return true;
            }
            cur = self.heap.as_class(c).superclass;
        }
        false
    }

    fn is_non_instantiable_builtin(&self, cls: ObjRef) -> bool {
        let b = &self.builtins;
        cls == b.null || cls == b.function || cls == b.module || cls == b.stack_trace
            || cls == b.class || cls == b.table
    }

    fn is_instantiable_builtin(&self, cls: ObjRef) -> bool {
        let b = &self.builtins;
        cls == b.list || cls == b.tuple || cls == b.number || cls == b.boolean || cls == b.string
    }

    fn is_builtin_class(&self, cls: ObjRef) -> bool {
        self.is_non_instantiable_builtin(cls) || self.is_instantiable_builtin(cls)
    }

    // ===== Raising ===== //

    /// Creates an instance of the named built-in exception class with the
    /// given message, attaches a fresh stack trace and leaves it on the
    /// stack. Returns the `Raised` marker for the caller to propagate.
    pub fn raise(&mut self, class_name: &str, msg: &str) -> Raised {
        let name = self.intern(class_name);
        let cls = match self.heap.as_module(self.core_module).globals.get(name) {
            Some(Value::Obj(r)) if self.heap.is_class(r) => r,
            _ => self.builtins.exception,
        };
        let inst = self.alloc(cls, ObjKind::Instance(InstanceData { fields: Table::new() }));
        self.push(Value::Obj(inst));
        let msg_ref = self.intern(msg);
        let msg_key = self.sym(Sym::Msg);
        self.heap.as_instance_mut(inst).fields.put(msg_key, Value::Obj(msg_ref));
        self.attach_stack_trace(inst);
        Raised
    }

    fn attach_stack_trace(&mut self, exc: ObjRef) {
        let st = self.alloc(self.builtins.stack_trace, ObjKind::StackTrace(Vec::new()));
        let key = self.sym(Sym::Stacktrace);
        self.heap.as_instance_mut(exc).fields.put(key, Value::Obj(st));
    }

    fn poll_break(&mut self) -> Result<(), Raised> {
        if self.eval_break.load(Ordering::Relaxed) {
            self.eval_break.store(false, Ordering::Relaxed);
            return Err(self.raise("Exception", "evaluation interrupted"));
        }
        Ok(())
    }

    /// Shared flag a host may set from a signal handler or another thread to
    /// interrupt evaluation at the next backward jump or call.
    pub fn eval_break_handle(&self) -> Arc<AtomicBool> {
        self.eval_break.clone()
    }

    // ===== Upvalues ===== //

    /// Finds the open upvalue for a stack slot, or inserts a new one keeping
    /// the list sorted by descending slot.
    fn capture_upvalue(&mut self, slot: usize) -> ObjRef {
        let mut i = 0;
        while i < self.open_upvalues.len() {
            let s = match self.heap.as_upvalue(self.open_upvalues[i]) {
                UpvalueState::Open(s) => *s,
                UpvalueState::Closed(_) => panic!("Closed upvalue in open list"),
            };
            if s == slot {
                return self.open_upvalues[i];
            }
            if s < slot {
                break;
            }
            i += 1;
        }
        let uv = self.alloc(self.builtins.null, ObjKind::Upvalue(UpvalueState::Open(slot)));
        self.open_upvalues.insert(i, uv);
        uv
    }

    /// Closes every open upvalue at or above `threshold`: the current stack
    /// value moves into the upvalue's own cell, after which the slot is free
    /// to be reused.
    pub(crate) fn close_upvalues(&mut self, threshold: usize) {
        while let Some(&uv) = self.open_upvalues.first() {
            let slot = match self.heap.as_upvalue(uv) {
                UpvalueState::Open(s) => *s,
                UpvalueState::Closed(_) => panic!("Closed upvalue in open list"),
            };
            if slot < threshold {
                break;
            }
            let value = self.stack[slot];
            *self.heap.as_upvalue_mut(uv) = UpvalueState::Closed(value);
            self.open_upvalues.remove(0);
        }
    }

    fn upvalue_get(&self, uv: ObjRef) -> Value {
        match self.heap.as_upvalue(uv) {
            UpvalueState::Open(slot) => self.stack[*slot],
            UpvalueState::Closed(v) => *v,
        }
    }

    fn upvalue_set(&mut self, uv: ObjRef, v: Value) {
        match *self.heap.as_upvalue(uv) {
            UpvalueState::Open(slot) => self.stack[slot] = v,
            UpvalueState::Closed(_) => *self.heap.as_upvalue_mut(uv) = UpvalueState::Closed(v),
        }
    }

    // ===== Call machinery ===== //

    fn frame_function(&self, frame_idx: usize) -> ObjRef {
        self.heap.as_closure(self.frames[frame_idx].fun).fun
    }

    /// Reinterprets the callee slot by object kind and transfers control.
    /// The callee sits at `stack[top - argc]` with its arguments above it.
    pub(crate) fn call_value(&mut self, callee: Value, argc: u8) -> Result<(), Raised> {
        if let Value::Obj(r) = callee {
            if self.heap.is_closure(r) {
                return self.call_function(r, argc);
            }
            if self.heap.is_native(r) {
                return self.call_native(r, argc);
            }
            if matches!(self.heap.get(r).kind, ObjKind::Bound(_)) {
                let BoundData { receiver, method } = *self.heap.as_bound(r);
                let idx = self.stack.len() - 1 - argc as usize;
                self.stack[idx] = receiver;
                return self.call_value(Value::Obj(method), argc);
            }
            if self.heap.is_class(r) {
                return self.call_class(r, argc);
            }
        }
        let cls = self.type_name(callee);
        Err(self.raise("TypeException", &format!("Object {} is not a callable.", cls)))
    }

    /// Class instantiation. Instantiable built-ins construct themselves in
    /// their ctor and get `null` for the implicit receiver; everything else
    /// gets a fresh instance in the callee slot before `new` is invoked.
    fn call_class(&mut self, cls: ObjRef, argc: u8) -> Result<(), Raised> {
        if self.is_non_instantiable_builtin(cls) {
            let name = self.heap.as_class(cls).name.clone();
            return Err(self.raise(
                "Exception",
                &format!("class {} can't be directly instantiated", name),
            ));
        }

        let callee_idx = self.stack.len() - 1 - argc as usize;
        if self.is_instantiable_builtin(cls) {
            self.stack[callee_idx] = Value::Null;
        } else {
            let inst = self.alloc(cls, ObjKind::Instance(InstanceData { fields: Table::new() }));
            self.stack[callee_idx] = Value::Obj(inst);
        }

        let ctor = self.sym(Sym::Ctor);
        match self.heap.as_class(cls).methods.get(ctor) {
            Some(m) => self.call_value(m, argc),
            None if argc != 0 => {
                let name = self.heap.as_class(cls).name.clone();
                Err(self.raise(
                    "TypeException",
                    &format!("Function {}.new() takes exactly 0 arguments, {} supplied.", name, argc),
                ))
            }
            // No ctor, no args: the fresh instance in the callee slot is the
            // result.
            None => Ok(()),
        }
    }

    fn callable_names(&self, callable: ObjRef) -> (String, String) {
        match &self.heap.get(callable).kind {
            ObjKind::Closure(c) => {
                let f = self.heap.as_fun(c.fun);
                let module = self.heap.as_str(self.heap.as_module(f.module).name).to_string();
                (module, f.proto.name.clone())
            }
            ObjKind::Native(n) => {
                let module = self.heap.as_str(self.heap.as_module(n.module).name).to_string();
                (module, n.name.clone())
            }
            k => panic!("Not a callable: {:?}", k),
        }
    }

    fn arg_error(&mut self, callable: ObjRef, expected: u8, supplied: u8, quantity: &str) -> Raised {
        let (module, name) = self.callable_names(callable);
        self.raise(
            "TypeException",
            &format!(
                "Function {}.{}() takes {} {} arguments, {} supplied.",
                module, name, quantity, expected, supplied
            ),
        )
    }

    /// Normalizes the arguments already on the stack to the callable's
    /// parameter list: materializes defaults positionally and packs varargs
    /// extras into a fresh tuple.
    fn adjust_arguments(&mut self, callable: ObjRef, argc: u8) -> Result<(), Raised> {
        let (arity, defaultc, vararg) = match &self.heap.get(callable).kind {
            ObjKind::Closure(c) => {
                let f = self.heap.as_fun(c.fun);
                (f.proto.arity, f.defaults.len() as u8, f.proto.vararg)
            }
            ObjKind::Native(n) => (n.arity, n.defaults.len() as u8, n.vararg),
            k => panic!("Not a callable: {:?}", k),
        };

        let most = arity;
        let least = most - defaultc;

        if !vararg && most == least && argc != most {
            return Err(self.arg_error(callable, most, argc, "exactly"));
        }
        if !vararg && argc > most {
            return Err(self.arg_error(callable, most, argc, "at most"));
        }
        if argc < least {
            return Err(self.arg_error(callable, least, argc, "at least"));
        }

        for i in (argc - least) as usize..defaultc as usize {
            let d = match &self.heap.get(callable).kind {
                ObjKind::Closure(c) => self.heap.as_fun(c.fun).defaults[i],
                ObjKind::Native(n) => n.defaults[i],
                _ => unreachable!(),
            };
            self.push(d);
        }

        if vararg {
            let extra = if argc > most { (argc - most) as usize } else { 0 };
            self.make_tuple(extra);
        }
        Ok(())
    }

    /// Pops `count` values into a fresh tuple and pushes it.
    fn make_tuple(&mut self, count: usize) {
        let tup = self.alloc(
            self.builtins.tuple,
            ObjKind::Tuple(vec![Value::Null; count].into_boxed_slice()),
        );
        for i in (0..count).rev() {
            let v = self.pop();
            self.heap.as_tuple_mut(tup)[i] = v;
        }
        self.push(Value::Obj(tup));
    }

    pub(crate) fn call_function(&mut self, closure: ObjRef, argc: u8) -> Result<(), Raised> {
        if self.frames.len() + 1 >= RECURSION_LIMIT {
            return Err(self.raise("StackOverflowException", ""));
        }
        self.adjust_arguments(closure, argc)?;

        let f = self.heap.as_closure(closure).fun;
        let (arity, vararg, module) = {
            let fd = self.heap.as_fun(f);
            (fd.proto.arity, fd.proto.vararg, fd.module)
        };
        let base = self.stack.len() - (arity as usize + 1) - (vararg as usize);
        // Worst-case frame window; the operand stack only reallocates here,
        // never mid-instruction.
        self.stack.reserve(u8::MAX as usize);
        self.frames.push(Frame { ip: 0, base, fun: closure, handlers: Vec::new() });
        self.module = module;
        Ok(())
    }

    fn call_native(&mut self, native: ObjRef, argc: u8) -> Result<(), Raised> {
        if self.frames.len() + 1 >= RECURSION_LIMIT {
            return Err(self.raise("StackOverflowException", ""));
        }
        self.adjust_arguments(native, argc)?;

        let (arity, vararg, module, fun) = {
            let n = self.heap.as_native(native);
            (n.arity, n.vararg, n.module, n.fun)
        };
        let fun = match fun {
            Some(f) => f,
            None => {
                let name = self.heap.as_native(native).name.clone();
                return Err(self.raise("Exception", &format!("Cannot resolve native {}.", name)));
            }
        };

        let base = self.stack.len() - (arity as usize + 1) - (vararg as usize);
        self.frames.push(Frame { ip: 0, base, fun: native, handlers: Vec::new() });

        let saved_module = self.module;
        let saved_api = self.api_base;
        self.module = module;
        self.api_base = base;

        match fun(self) {
            Ok(()) => {
                let ret = self.pop();
                let base = self.frames.last().unwrap().base;
                self.stack.truncate(base);
                self.frames.pop();
                self.module = saved_module;
                self.api_base = saved_api;
                self.push(ret);
                Ok(())
            }
            Err(raised) => {
                // The native frame stays for the unwinder to record and pop.
                self.module = saved_module;
                self.api_base = saved_api;
                Err(raised)
            }
        }
    }

    /// Single-table method lookup (superclass entries were merged at class
    /// creation) followed by a call.
    pub(crate) fn invoke_method(&mut self, cls: ObjRef, name: ObjRef, argc: u8) -> Result<(), Raised> {
        match self.heap.as_class(cls).methods.get(name) {
            Some(m) => self.call_value(m, argc),
            None => {
                let c = self.heap.as_class(cls).name.clone();
                let n = self.heap.as_str(name).to_string();
                Err(self.raise("MethodException", &format!("Method {}.{}() doesn't exist.", c, n)))
            }
        }
    }

    /// Invoke-by-name on the value at `stack[top - argc]`. Instance fields
    /// shadow methods; module globals shadow module-class methods.
    pub(crate) fn invoke_value(&mut self, name: ObjRef, argc: u8) -> Result<(), Raised> {
        let v = *self.peek(argc as usize);
        if let Value::Obj(r) = v {
            if self.heap.is_instance(r) {
                if let Some(field) = self.heap.as_instance(r).fields.get(name) {
                    return self.call_value(field, argc);
                }
                let cls = self.heap.class_of_obj(r);
                return self.invoke_method(cls, name, argc);
            }
            if self.heap.is_module(r) {
                if let Some(g) = self.heap.as_module(r).globals.get(name) {
                    return self.call_value(g, argc);
                }
                if let Some(m) = self.heap.as_class(self.builtins.module).methods.get(name) {
                    return self.call_value(m, argc);
                }
                let m = self.heap.as_str(self.heap.as_module(r).name).to_string();
                let n = self.heap.as_str(name).to_string();
                return Err(self.raise(
                    "NameException",
                    &format!("Name `{}` is not defined in module {}.", n, m),
                ));
            }
        }
        let cls = self.class_of(v);
        self.invoke_method(cls, name, argc)
    }

    /// Pops the receiver and pushes a BoundMethod over it, if the class has
    /// the method. The pair is immutable after creation.
    fn bind_method(&mut self, cls: ObjRef, name: ObjRef) -> bool {
        match self.heap.as_class(cls).methods.get(name) {
            Some(Value::Obj(m)) => {
                let receiver = *self.peek(0);
                let bound = self.alloc(
                    self.builtins.function,
                    ObjKind::Bound(BoundData { receiver, method: m }),
                );
                self.pop();
                self.push(Value::Obj(bound));
                true
            }
            _ => false,
        }
    }

    // ===== Field access ===== //

    fn get_field(&mut self, name: ObjRef) -> Result<(), Raised> {
        let v = *self.peek(0);
        if let Value::Obj(r) = v {
            if self.heap.is_instance(r) {
                if let Some(val) = self.heap.as_instance(r).fields.get(name) {
                    self.pop();
                    self.push(val);
                    return Ok(());
                }
                let cls = self.heap.class_of_obj(r);
                if self.bind_method(cls, name) {
                    return Ok(());
                }
                let c = self.heap.as_class(cls).name.clone();
                let n = self.heap.as_str(name).to_string();
                return Err(self.raise(
                    "FieldException",
                    &format!("Object {} doesn't have field `{}`.", c, n),
                ));
            }
            if self.heap.is_module(r) {
                if let Some(val) = self.heap.as_module(r).globals.get(name) {
                    self.pop();
                    self.push(val);
                    return Ok(());
                }
                if self.bind_method(self.builtins.module, name) {
                    return Ok(());
                }
                let m = self.heap.as_str(self.heap.as_module(r).name).to_string();
                let n = self.heap.as_str(name).to_string();
                return Err(self.raise(
                    "NameException",
                    &format!("Name `{}` is not defined in module {}.", n, m),
                ));
            }
        }
        let cls = self.class_of(v);
        if self.bind_method(cls, name) {
            return Ok(());
        }
        let c = self.heap.as_class(cls).name.clone();
        let n = self.heap.as_str(name).to_string();
        Err(self.raise("FieldException", &format!("Object {} doesn't have field `{}`.", c, n)))
    }

    /// Stack contract: `[.., value, object]`; pops the object, leaving the
    /// assigned value.
    fn set_field(&mut self, name: ObjRef) -> Result<(), Raised> {
        let v = self.pop();
        if let Value::Obj(r) = v {
            if self.heap.is_instance(r) {
                let value = *self.peek(0);
                self.heap.as_instance_mut(r).fields.put(name, value);
                return Ok(());
            }
            if self.heap.is_module(r) {
                let value = *self.peek(0);
                self.heap.as_module_mut(r).globals.put(name, value);
                return Ok(());
            }
        }
        let c = self.type_name(v);
        let n = self.heap.as_str(name).to_string();
        Err(self.raise("FieldException", &format!("Object {} doesn't have field `{}`.", c, n)))
    }

    // ===== Subscript ===== //

    pub(crate) fn check_index(&mut self, index: Value, len: usize, what: &str) -> Result<usize, Raised> {
        match index {
            Value::Num(n) if is_int(n) => {
                if n >= 0.0 && (n as usize) < len {
                    Ok(n as usize)
                } else {
                    Err(self.raise(
                        "TypeException",
                        &format!("{} index {} out of bounds for length {}.", what, num_to_str(n), len),
                    ))
                }
            }
            _ => Err(self.raise(
                "TypeException",
                &format!("Index of {} subscript must be an integer.", what),
            )),
        }
    }

    /// Stack contract: `[.., operand, index]`.
    fn get_index(&mut self) -> Result<(), Raised> {
        let index = *self.peek(0);
        let operand = *self.peek(1);
        if let Value::Obj(r) = operand {
            if self.heap.is_list(r) {
                let len = self.heap.as_list(r).len();
                let i = self.check_index(index, len, "List")?;
                let v = self.heap.as_list(r)[i];
                self.pop();
                self.pop();
                self.push(v);
                return Ok(());
            }
            if self.heap.is_tuple(r) {
                let len = self.heap.as_tuple(r).len();
                let i = self.check_index(index, len, "Tuple")?;
                let v = self.heap.as_tuple(r)[i];
                self.pop();
                self.pop();
                self.push(v);
                return Ok(());
            }
            if self.heap.is_str(r) {
                let len = self.heap.as_str(r).chars().count();
                let i = self.check_index(index, len, "String")?;
                let c = self.heap.as_str(r).chars().nth(i).unwrap();
                let s = self.intern(&c.to_string());
                self.pop();
                self.pop();
                self.push(Value::Obj(s));
                return Ok(());
            }
        }
        let cls = self.class_of(operand);
        let get = self.sym(Sym::Get);
        self.invoke_method(cls, get, 1)
    }

    /// Stack contract: `[.., value, index, operand]`. The list fast path
    /// leaves the assigned value; the overload path swaps value and operand
    /// and invokes `__set__(index, value)`, leaving its return value.
    fn set_index(&mut self) -> Result<(), Raised> {
        let operand = *self.peek(0);
        if let Value::Obj(r) = operand {
            if self.heap.is_list(r) {
                let index = *self.peek(1);
                let len = self.heap.as_list(r).len();
                let i = self.check_index(index, len, "List")?;
                self.pop();
                self.pop();
                let value = *self.peek(0);
                self.heap.as_list_mut(r)[i] = value;
                return Ok(());
            }
        }
        let len = self.stack.len();
        self.stack.swap(len - 1, len - 3);
        let cls = self.class_of(operand);
        let set = self.sym(Sym::Set);
        self.invoke_method(cls, set, 2)
    }

    // ===== Operators ===== //

    /// Slow path for binary operators: string concatenation, primitive
    /// equality, then the forward/reverse overload protocol.
    fn binary_overload(&mut self, op: BinaryOp) -> Result<(), Raised> {
        if op == BinaryOp::Add {
            if let (Value::Obj(a), Value::Obj(b)) = (*self.peek(1), *self.peek(0)) {
                if self.heap.is_str(a) && self.heap.is_str(b) {
                    let s = format!("{}{}", self.heap.as_str(a), self.heap.as_str(b));
                    let res = self.intern(&s);
                    self.pop();
                    self.pop();
                    self.push(Value::Obj(res));
                    return Ok(());
                }
            }
        }

        if op == BinaryOp::Equal {
            // Primitive equality whenever the left operand is a scalar;
            // objects go through `__eq__` (every class inherits the identity
            // default from Object).
            if matches!(self.peek(1), Value::Num(_) | Value::Bool(_) | Value::Null) {
                let b = self.pop();
                let a = self.pop();
                self.push(Value::Bool(a.equals(&b)));
                return Ok(());
            }
        }

        let forward = match op.overload() {
            Some(sym) => sym,
            None => return Err(self.raise("TypeException", "Operands of `^` must be numbers.")),
        };

        let cls1 = self.class_of(*self.peek(1));
        let cls2 = self.class_of(*self.peek(0));

        let fname = self.sym(forward);
        if let Some(m) = self.heap.as_class(cls1).methods.get(fname) {
            return self.call_value(m, 1);
        }

        if let Some(rev) = op.reverse() {
            let len = self.stack.len();
            self.stack.swap(len - 1, len - 2);
            let rname = self.sym(rev);
            if let Some(m) = self.heap.as_class(cls2).methods.get(rname) {
                return self.call_value(m, 1);
            }
        }

        let n1 = self.heap.as_class(cls1).name.clone();
        let n2 = self.heap.as_class(cls2).name.clone();
        Err(self.raise(
            "TypeException",
            &format!("Operator {} not defined for types {}, {}", op.symbol(), n1, n2),
        ))
    }

    fn unpack(&mut self, n: u8) -> Result<(), Raised> {
        let v = *self.peek(0);
        let values: Vec<Value> = match v {
            Value::Obj(r) if self.heap.is_tuple(r) => self.heap.as_tuple(r).to_vec(),
            Value::Obj(r) if self.heap.is_list(r) => self.heap.as_list(r).clone(),
            _ => {
                let t = self.type_name(v);
                return Err(self.raise(
                    "TypeException",
                    &format!("Can unpack only Tuple or List, got {}.", t),
                ));
            }
        };
        if (n as usize) != values.len() {
            return Err(self.raise("TypeException", "too few values to unpack"));
        }
        self.pop();
        for &v in values.iter() {
            self.push(v);
        }
        Ok(())
    }

    /// Allocates a class with the superclass's methods eagerly merged in, and
    /// pushes it.
    fn create_class(&mut self, name: ObjRef, superclass: ObjRef) {
        let methods = self.heap.as_class(superclass).methods.clone();
        let name_str = self.heap.as_str(name).to_string();
        let cls = self.alloc(
            self.builtins.class,
            ObjKind::Class(ClassData { name: name_str, superclass: Some(superclass), methods }),
        );
        self.push(Value::Obj(cls));
    }

    fn const_str(&self, fun: ObjRef, idx: u16) -> ObjRef {
        match self.heap.as_fun(fun).consts[idx as usize] {
            Value::Obj(r) if self.heap.is_str(r) => r,
            v => panic!("Constant {} is not a string: {:?}", idx, v),
        }
    }

    fn resolve_native(&self, class: Option<&str>, name: &str) -> Option<NativeFn> {
        let module = self.heap.as_str(self.heap.as_module(self.module).name).to_string();
        self.natives
            .get(&(module, class.map(String::from), String::from(name)))
            .copied()
    }

    fn function_module(&self, fun: ObjRef) -> ObjRef {
        self.heap.as_fun(fun).module
    }

    // ===== Display ===== //

    /// Human-readable rendering used by `__string__` defaults and the
    /// embedding API. Collection nesting is cut off at a fixed depth so
    /// self-referential structures terminate.
    pub fn to_display(&self, v: Value) -> String {
        self.display_depth(v, 0, false)
    }

    fn display_depth(&self, v: Value, depth: usize, repr: bool) -> String {
        match v {
            Value::Null => String::from("null"),
            Value::Bool(b) => b.to_string(),
            Value::Num(n) => num_to_str(n),
            Value::Handle(h) => format!("<handle {}>", h),
            Value::Cause(_) => String::from("<cause>"),
            Value::Obj(r) => match &self.heap.get(r).kind {
                ObjKind::Str(s) => {
                    if repr {
                        format!("'{}'", s)
                    } else {
                        s.to_string()
                    }
                }
                ObjKind::List(values) => {
                    if depth >= 4 {
                        return String::from("[..]");
                    }
                    format!("[{}]", values.iter().map(|v| self.display_depth(*v, depth + 1, true)).join(", "))
                }
                ObjKind::Tuple(values) => {
                    if depth >= 4 {
                        return String::from("(..)");
                    }
                    format!("({})", values.iter().map(|v| self.display_depth(*v, depth + 1, true)).join(", "))
                }
                ObjKind::Table(map) => {
                    if depth >= 4 {
                        return String::from("{..}");
                    }
                    format!(
                        "{{{}}}",
                        map.iter()
                            .map(|(k, v)| format!(
                                "{}: {}",
                                self.display_depth(k, depth + 1, true),
                                self.display_depth(v, depth + 1, true)
                            ))
                            .join(", ")
                    )
                }
                ObjKind::Fun(f) => format!("<function {}>", f.proto.name),
                ObjKind::Closure(c) => {
                    format!("<function {}>", self.heap.as_fun(c.fun).proto.name)
                }
                ObjKind::Native(n) => format!("<native {}>", n.name),
                ObjKind::Class(c) => format!("<class {}>", c.name),
                ObjKind::Instance(_) => {
                    format!("<{} object>", self.heap.as_class(self.heap.class_of_obj(r)).name)
                }
                ObjKind::Bound(_) => String::from("<bound method>"),
                ObjKind::Module(m) => {
                    format!("<module {}>", self.heap.as_str(m.name))
                }
                ObjKind::Upvalue(_) => String::from("<upvalue>"),
                ObjKind::StackTrace(_) => String::from("<stacktrace>"),
            },
        }
    }

    // ===== Unwinding ===== //

    /// Walks frames from the top toward `depth`, recording each into the
    /// pending exception's stack trace. Restores the innermost handler found
    /// and returns `true` to resume dispatch; returns `false` when the
    /// exception escapes `depth`, leaving it on top of the stack.
    pub(crate) fn unwind_stack(&mut self, depth: usize) -> bool {
        let exc = match *self.peek(0) {
            Value::Obj(r) if self.heap.is_instance(r) => r,
            v => panic!("Unwinding without an exception on the stack: {:?}", v),
        };
        let key = self.sym(Sym::Stacktrace);
        let trace_ref = match self.heap.as_instance(exc).fields.get(key) {
            Some(Value::Obj(t)) => t,
            _ => panic!("Exception has no stack trace attached"),
        };

        while self.frames.len() > depth {
            let frame_idx = self.frames.len() - 1;
            let fun = self.frames[frame_idx].fun;

            let (module, line, function) = if self.heap.is_closure(fun) {
                let f = self.heap.as_closure(fun).fun;
                let fd = self.heap.as_fun(f);
                let ip = self.frames[frame_idx].ip;
                let line = fd.proto.lines.get(ip.saturating_sub(1)).copied();
                (fd.module, line, fd.proto.name.clone())
            } else {
                let nd = self.heap.as_native(fun);
                (nd.module, None, nd.name.clone())
            };

            self.module = module;
            let module_name = self.heap.as_str(self.heap.as_module(module).name).to_string();
            self.heap.as_trace_mut(trace_ref).push(TraceLine { line, module: module_name, function });

            if let Some(h) = self.frames[frame_idx].handlers.pop() {
                let exc_val = self.pop();
                self.close_upvalues(h.saved_sp);
                self.stack.truncate(h.saved_sp);
                self.push(exc_val);
                self.push(Value::Cause(UnwindCause::Except));
                self.frames[frame_idx].ip = h.target;
                return true;
            }

            let base = self.frames[frame_idx].base;
            self.close_upvalues(base);
            self.frames.pop();
        }
        false
    }

    /// Formats the exception on top of the stack the way it is delivered to
    /// the host error callback.
    pub(crate) fn format_uncaught(&self) -> String {
        let exc = self.peek(0).as_obj();
        let cls = self.heap.as_class(self.heap.class_of_obj(exc)).name.clone();
        let msg = match self.heap.as_instance(exc).fields.get(self.sym(Sym::Msg)) {
            Some(m) => self.to_display(m),
            None => String::new(),
        };

        let mut out = String::from("Traceback (most recent call last):\n");
        if let Some(Value::Obj(t)) = self.heap.as_instance(exc).fields.get(self.sym(Sym::Stacktrace)) {
            for record in self.heap.as_trace(t).iter().rev() {
                match record.line {
                    Some(line) => {
                        out += &format!("  [line {}] module {}, in {}\n", line, record.module, record.function)
                    }
                    None => out += &format!("  [native] module {}, in {}\n", record.module, record.function),
                }
            }
        }
        out += &format!("{}: {}", cls, msg);
        out
    }

    // ===== The dispatch loop ===== //

    /// Executes bytecode starting from the current top frame, returning when
    /// the frame count drops back to `depth` with the result on the stack
    /// (`true`), or when an uncaught exception propagates past `depth` and
    /// is left on the stack (`false`).
    pub(crate) fn run_eval(&mut self, depth: usize) -> bool {
        debug_assert!(self.frames.len() > depth, "No frame to evaluate");

        let mut frame_idx: usize = self.frames.len() - 1;
        let mut closure_ref: ObjRef = self.frames[frame_idx].fun;
        let mut fun_ref: ObjRef = self.frame_function(frame_idx);
        let mut base: usize = self.frames[frame_idx].base;
        let mut proto: Rc<FunProto> = self.heap.as_fun(fun_ref).proto.clone();
        let mut ip: usize = self.frames[frame_idx].ip;

        macro_rules! load_frame {
            () => {{
                frame_idx = self.frames.len() - 1;
                closure_ref = self.frames[frame_idx].fun;
                fun_ref = self.frame_function(frame_idx);
                base = self.frames[frame_idx].base;
                proto = self.heap.as_fun(fun_ref).proto.clone();
                ip = self.frames[frame_idx].ip;
            }};
        }

        macro_rules! save_frame {
            () => {
                self.frames[frame_idx].ip = ip;
            };
        }

        macro_rules! unwind {
            () => {{
                save_frame!();
                if !self.unwind_stack(depth) {
                    return false;
                }
                load_frame!();
                continue;
            }};
        }

        // Runs an operation that may push a new frame; reloads the cached
        // frame registers afterwards.
        macro_rules! frame_call {
            ($e:expr) => {{
                save_frame!();
                if $e.is_err() {
                    unwind!();
                }
                load_frame!();
            }};
        }

        macro_rules! do_return {
            () => {{
                let ret = self.pop();
                let mut resumed = false;
                while let Some(h) = self.frames[frame_idx].handlers.pop() {
                    if h.kind == HandlerKind::Ensure {
                        self.close_upvalues(h.saved_sp);
                        self.stack.truncate(h.saved_sp);
                        self.push(ret);
                        self.push(Value::Cause(UnwindCause::Return));
                        ip = h.target;
                        resumed = true;
                        break;
                    }
                }
                if !resumed {
                    self.close_upvalues(base);
                    self.stack.truncate(base);
                    self.push(ret);
                    self.frames.pop();
                    if self.frames.len() == depth {
                        return true;
                    }
                    load_frame!();
                    self.module = self.function_module(fun_ref);
                }
            }};
        }

        loop {
            let op = proto.code[ip];
            ip += 1;
            trace::trace_interpreter!("{:04} {:?}", ip - 1, op);

            match op {
                Opcode::Null => self.push(Value::Null),
                Opcode::True => self.push(Value::Bool(true)),
                Opcode::False => self.push(Value::Bool(false)),

                Opcode::Constant(idx) => {
                    let c = self.heap.as_fun(fun_ref).consts[idx as usize];
                    self.push(c);
                }

                Opcode::Pop => {
                    self.pop();
                }
                Opcode::Dup => {
                    let v = *self.peek(0);
                    self.push(v);
                }

                Opcode::GetLocal(i) => {
                    let v = self.stack[base + i as usize];
                    self.push(v);
                }
                Opcode::SetLocal(i) => {
                    self.stack[base + i as usize] = *self.peek(0);
                }

                Opcode::GetGlobal(idx) => {
                    let name = self.const_str(fun_ref, idx);
                    match self.heap.as_module(self.module).globals.get(name) {
                        Some(v) => self.push(v),
                        None => {
                            let n = self.heap.as_str(name).to_string();
                            let _ = self.raise("NameException", &format!("Name `{}` is not defined.", n));
                            unwind!();
                        }
                    }
                }
                Opcode::SetGlobal(idx) => {
                    let name = self.const_str(fun_ref, idx);
                    if self.heap.as_module(self.module).globals.contains(name) {
                        let v = *self.peek(0);
                        let m = self.module;
                        self.heap.as_module_mut(m).globals.put(name, v);
                    } else {
                        let n = self.heap.as_str(name).to_string();
                        let _ = self.raise("NameException", &format!("Name `{}` is not defined.", n));
                        unwind!();
                    }
                }
                Opcode::DefineGlobal(idx) => {
                    let name = self.const_str(fun_ref, idx);
                    let v = self.pop();
                    let m = self.module;
                    self.heap.as_module_mut(m).globals.put(name, v);
                }

                Opcode::GetUpvalue(i) => {
                    let uv = self.heap.as_closure(closure_ref).upvalues[i as usize];
                    let v = self.upvalue_get(uv);
                    self.push(v);
                }
                Opcode::SetUpvalue(i) => {
                    let uv = self.heap.as_closure(closure_ref).upvalues[i as usize];
                    let v = *self.peek(0);
                    self.upvalue_set(uv, v);
                }
                Opcode::CloseUpvalue => {
                    let top = self.stack.len() - 1;
                    self.close_upvalues(top);
                    self.pop();
                }

                Opcode::Unary(UnaryOp::Not) => {
                    let v = self.pop();
                    self.push(Value::Bool(!v.truthy()));
                }
                Opcode::Unary(UnaryOp::Neg) => {
                    if self.peek(0).is_num() {
                        let n = self.pop().as_num();
                        self.push(Value::Num(-n));
                    } else {
                        let cls = self.class_of(*self.peek(0));
                        let neg = self.sym(Sym::Neg);
                        frame_call!(self.invoke_method(cls, neg, 0));
                    }
                }

                Opcode::Binary(bop) => {
                    if self.peek(0).is_num() && self.peek(1).is_num() {
                        let b = self.pop().as_num();
                        let a = self.pop().as_num();
                        self.push(bop.apply_num(a, b));
                    } else {
                        frame_call!(self.binary_overload(bop));
                    }
                }

                Opcode::Is => {
                    let rhs = *self.peek(0);
                    let cls = match rhs {
                        Value::Obj(r) if self.heap.is_class(r) => r,
                        _ => {
                            let _ = self.raise("TypeException", "Right operand of `is` must be a class.");
                            unwind!();
                        }
                    };
                    self.pop();
                    let a = self.pop();
                    let res = self.is_instance(a, cls);
                    self.push(Value::Bool(res));
                }

                Opcode::GetIndex => frame_call!(self.get_index()),
                Opcode::SetIndex => frame_call!(self.set_index()),

                Opcode::GetField(idx) => {
                    let name = self.const_str(fun_ref, idx);
                    if self.get_field(name).is_err() {
                        unwind!();
                    }
                }
                Opcode::SetField(idx) => {
                    let name = self.const_str(fun_ref, idx);
                    if self.set_field(name).is_err() {
                        unwind!();
                    }
                }

                Opcode::Jump(off) => {
                    if off < 0 && self.poll_break().is_err() {
                        unwind!();
                    }
                    ip = ip.add_offset(off);
                }
                Opcode::JumpIfFalse(off) => {
                    let v = self.pop();
                    if !v.truthy() {
                        ip = ip.add_offset(off);
                    }
                }
                Opcode::JumpIfTrue(off) => {
                    let v = self.pop();
                    if v.truthy() {
                        ip = ip.add_offset(off);
                    }
                }

                Opcode::ForIter => {
                    let seq = *self.peek(1);
                    let it = *self.peek(0);
                    self.push(seq);
                    self.push(it);
                    let iter = self.sym(Sym::Iter);
                    frame_call!(self.invoke_value(iter, 1));
                }
                Opcode::ForNext(off) => {
                    let len = self.stack.len();
                    self.stack[len - 2] = self.stack[len - 1];
                    let v = self.pop();
                    if v.truthy() {
                        let seq = *self.peek(1);
                        let it = *self.peek(0);
                        self.push(seq);
                        self.push(it);
                        let next = self.sym(Sym::Next);
                        frame_call!(self.invoke_value(next, 1));
                    } else {
                        ip = ip.add_offset(off);
                    }
                }

                Opcode::Call(argc) => {
                    if self.poll_break().is_err() {
                        unwind!();
                    }
                    let callee = *self.peek(argc as usize);
                    frame_call!(self.call_value(callee, argc));
                }
                Opcode::Invoke(idx, argc) => {
                    if self.poll_break().is_err() {
                        unwind!();
                    }
                    let name = self.const_str(fun_ref, idx);
                    frame_call!(self.invoke_value(name, argc));
                }
                Opcode::Super(idx, argc) => {
                    let name = self.const_str(fun_ref, idx);
                    let sup = match self.heap.as_fun(fun_ref).consts[0] {
                        Value::Obj(r) => r,
                        v => panic!("super call without a superclass constant: {:?}", v),
                    };
                    frame_call!(self.invoke_method(sup, name, argc));
                }
                Opcode::SuperBind(idx) => {
                    let name = self.const_str(fun_ref, idx);
                    let sup = match self.heap.as_fun(fun_ref).consts[0] {
                        Value::Obj(r) => r,
                        v => panic!("super bind without a superclass constant: {:?}", v),
                    };
                    if !self.bind_method(sup, name) {
                        let c = self.heap.as_class(sup).name.clone();
                        let n = self.heap.as_str(name).to_string();
                        let _ = self.raise("MethodException", &format!("Method {}.{}() doesn't exist.", c, n));
                        unwind!();
                    }
                }

                Opcode::Return => do_return!(),

                Opcode::NewList => {
                    let l = self.alloc(self.builtins.list, ObjKind::List(Vec::new()));
                    self.push(Value::Obj(l));
                }
                Opcode::AppendList => {
                    let v = *self.peek(0);
                    let l = self.peek(1).as_obj();
                    self.heap.as_list_mut(l).push(v);
                    self.pop();
                }
                Opcode::NewTuple(n) => {
                    self.make_tuple(n as usize);
                }
                Opcode::NewTable => {
                    let t = self.alloc(self.builtins.table, ObjKind::Table(ValueMap::new()));
                    self.push(Value::Obj(t));
                }

                Opcode::NewClosure(idx) => {
                    let f = match self.heap.as_fun(fun_ref).consts[idx as usize] {
                        Value::Obj(r) => r,
                        v => panic!("Closure constant is not a function: {:?}", v),
                    };
                    let c = self.alloc(
                        self.builtins.function,
                        ObjKind::Closure(ClosureData { fun: f, upvalues: Vec::new() }),
                    );
                    self.push(Value::Obj(c));
                }
                Opcode::CaptureLocal(i) => {
                    let uv = self.capture_upvalue(base + i as usize);
                    let c = self.peek(0).as_obj();
                    self.heap.as_closure_mut(c).upvalues.push(uv);
                }
                Opcode::CaptureUpvalue(i) => {
                    let uv = self.heap.as_closure(closure_ref).upvalues[i as usize];
                    let c = self.peek(0).as_obj();
                    self.heap.as_closure_mut(c).upvalues.push(uv);
                }

                Opcode::NewClass(idx) => {
                    let name = self.const_str(fun_ref, idx);
                    let object = self.builtins.object;
                    self.create_class(name, object);
                }
                Opcode::NewSubclass(idx) => {
                    let sup = match *self.peek(0) {
                        Value::Obj(r) if self.heap.is_class(r) => r,
                        _ => {
                            let _ = self.raise(
                                "TypeException",
                                "Superclass in class declaration must be a Class.",
                            );
                            unwind!();
                        }
                    };
                    if self.is_builtin_class(sup) {
                        let n = self.heap.as_class(sup).name.clone();
                        let _ = self.raise(
                            "TypeException",
                            &format!("Cannot subclass builtin class {}.", n),
                        );
                        unwind!();
                    }
                    // The superclass stays on the stack across the
                    // allocation; the new class replaces it.
                    let name = self.const_str(fun_ref, idx);
                    self.create_class(name, sup);
                    let len = self.stack.len();
                    self.stack.swap(len - 1, len - 2);
                    self.pop();
                }

                Opcode::DefMethod(idx) => {
                    let name = self.const_str(fun_ref, idx);
                    let cls = self.peek(1).as_obj();
                    let method = *self.peek(0);
                    let sup = self.heap.as_class(cls).superclass;
                    let sup_val = sup.map(Value::Obj).unwrap_or(Value::Null);
                    let f = self.heap.as_closure(method.as_obj()).fun;
                    let consts = &mut self.heap.as_fun_mut(f).consts;
                    if consts.is_empty() {
                        consts.push(sup_val);
                    } else {
                        consts[0] = sup_val;
                    }
                    self.pop();
                    self.heap.as_class_mut(cls).methods.put(name, method);
                }
                Opcode::NatMethod(name_idx, nat_idx) => {
                    let name = self.const_str(fun_ref, name_idx);
                    let cls = self.peek(0).as_obj();
                    let nat = match self.heap.as_fun(fun_ref).consts[nat_idx as usize] {
                        Value::Obj(r) => r,
                        v => panic!("Native constant is not an object: {:?}", v),
                    };
                    let cls_name = self.heap.as_class(cls).name.clone();
                    let nat_name = self.heap.as_native(nat).name.clone();
                    match self.resolve_native(Some(&cls_name), &nat_name) {
                        Some(f) => {
                            self.heap.as_native_mut(nat).fun = Some(f);
                            self.heap.as_class_mut(cls).methods.put(name, Value::Obj(nat));
                        }
                        None => {
                            let _ = self.raise(
                                "Exception",
                                &format!("Cannot resolve native method {}.{}().", cls_name, nat_name),
                            );
                            unwind!();
                        }
                    }
                }
                Opcode::Native(_) => {
                    let nat = self.peek(0).as_obj();
                    let nat_name = self.heap.as_native(nat).name.clone();
                    match self.resolve_native(None, &nat_name) {
                        Some(f) => self.heap.as_native_mut(nat).fun = Some(f),
                        None => {
                            let _ = self.raise("Exception", &format!("Cannot resolve native {}.", nat_name));
                            unwind!();
                        }
                    }
                }

                Opcode::Unpack(n) => {
                    if self.unpack(n).is_err() {
                        unwind!();
                    }
                }

                Opcode::Import(idx) => {
                    let name = self.const_str(fun_ref, idx);
                    frame_call!(self.op_import(name, None));
                }
                Opcode::ImportAs(idx, alias_idx) => {
                    let name = self.const_str(fun_ref, idx);
                    let alias = self.const_str(fun_ref, alias_idx);
                    frame_call!(self.op_import(name, Some(alias)));
                }
                Opcode::ImportFrom(idx) => {
                    let name = self.const_str(fun_ref, idx);
                    frame_call!(self.op_import_from(name));
                }
                Opcode::ImportName(mod_idx, name_idx) => {
                    let m = self.const_str(fun_ref, mod_idx);
                    let n = self.const_str(fun_ref, name_idx);
                    if self.op_import_name(m, n).is_err() {
                        unwind!();
                    }
                }

                Opcode::SetupExcept(off) | Opcode::SetupEnsure(off) => {
                    if self.frames[frame_idx].handlers.len() >= HANDLER_MAX {
                        let _ = self.raise("Exception", "Exceeded handler limit in try block nesting.");
                        unwind!();
                    }
                    let kind = match op {
                        Opcode::SetupExcept(_) => HandlerKind::Except,
                        _ => HandlerKind::Ensure,
                    };
                    let handler = Handler { kind, target: ip.add_offset(off), saved_sp: self.stack.len() };
                    self.frames[frame_idx].handlers.push(handler);
                }
                Opcode::PopHandler => {
                    self.frames[frame_idx].handlers.pop();
                }

                Opcode::Raise => {
                    let exc = *self.peek(0);
                    if !self.is_instance(exc, self.builtins.exception) {
                        let _ = self.raise("TypeException", "Can only raise Exception instances.");
                        unwind!();
                    }
                    self.attach_stack_trace(exc.as_obj());
                    unwind!();
                }

                Opcode::EndTry => match self.pop() {
                    Value::Cause(UnwindCause::Except) => unwind!(),
                    Value::Cause(UnwindCause::Return) => do_return!(),
                    Value::Null => {
                        self.pop();
                    }
                    v => panic!("Malformed try join point: {:?}", v),
                },
            }
        }
    }

    /// Runs the dispatch loop if the preceding operation pushed frames;
    /// converts an escaped exception back into `Raised`.
    pub(crate) fn run_until(&mut self, depth: usize) -> Result<(), Raised> {
        if self.frames.len() > depth && !self.run_eval(depth) {
            return Err(Raised);
        }
        Ok(())
    }
}


#[cfg(test)]
mod test {
    use std::fs;

    use crate::vm::builder::{Const, FunctionBuilder};
    use crate::vm::heap::{ClosureData, ObjKind};
    use crate::vm::opcode::Opcode::*;
    use crate::vm::operator::{BinaryOp, UnaryOp};
    use crate::vm::value::Value;
    use crate::vm::{Config, Raised, Stack, VirtualMachine};

    fn new_vm() -> VirtualMachine {
        VirtualMachine::new(Config::default())
    }

    /// A VM that collects on every allocation, stressing the rooting
    /// discipline of every operation the programs below exercise.
    fn new_gc_stressed_vm() -> VirtualMachine {
        let mut vm = VirtualMachine::new(Config::default());
        vm.heap.stress = true;
        vm
    }

    /// Wraps the function on top of the stack in a closure and runs it to
    /// completion, returning the result value or the formatted uncaught
    /// exception.
    fn run_pushed(vm: &mut VirtualMachine) -> Result<Value, String> {
        let f = vm.peek(0).as_obj();
        let c = vm.alloc(
            vm.builtins.function,
            ObjKind::Closure(ClosureData { fun: f, upvalues: Vec::new() }),
        );
        let top = vm.stack.len() - 1;
        vm.stack[top] = Value::Obj(c);

        let depth = vm.frames.len();
        if vm.call_function(c, 0).is_err() {
            return Err(fail(vm));
        }
        if vm.run_eval(depth) {
            Ok(vm.pop())
        } else {
            Err(fail(vm))
        }
    }

    fn run(vm: &mut VirtualMachine, b: &FunctionBuilder) -> Result<Value, String> {
        let main = vm.main_module;
        b.build(vm, main);
        run_pushed(vm)
    }

    fn fail(vm: &mut VirtualMachine) -> String {
        let msg = vm.format_uncaught();
        vm.close_upvalues(0);
        vm.stack.clear();
        vm.frames.clear();
        vm.module = vm.main_module;
        msg
    }

    // A host function that appends the display of its argument to the list
    // bound as `__out__` in the main module, so tests can assert on the
    // ordering of side effects.
    fn record_native(vm: &mut VirtualMachine) -> Result<(), Raised> {
        let v = vm.get_slot(1);
        let s = vm.to_display(v);
        let out = match vm.get_global("__main__", "__out__") {
            Some(Value::Obj(r)) => r,
            _ => panic!("record used without __out__"),
        };
        let interned = vm.intern(&s);
        vm.heap.as_list_mut(out).push(Value::Obj(interned));
        vm.push_null();
        Ok(())
    }

    fn with_record(vm: &mut VirtualMachine) {
        vm.push_list();
        vm.define_global("__main__", "__out__");
        vm.define_native("__main__", "record", 1, false, record_native);
    }

    fn recorded(vm: &mut VirtualMachine) -> Vec<String> {
        let out = vm.get_global("__main__", "__out__").unwrap();
        let values = vm.sequence_values(out).unwrap();
        values.iter().map(|v| vm.to_display(*v)).collect()
    }

    fn nums(vm: &VirtualMachine, v: Value) -> Vec<f64> {
        vm.sequence_values(v).unwrap().iter().map(|v| v.as_num()).collect()
    }

    // ===== Closures and upvalues ===== //

    // var x = (fun() var i = 0; return fun() i = i + 1; return i end end)()
    // x(); x(); x()  =>  3
    fn counter_program() -> FunctionBuilder {
        let mut counter = FunctionBuilder::new("counter");
        let one = counter.num_const(1.0);
        counter
            .op(GetUpvalue(0))
            .op(Constant(one))
            .op(Binary(BinaryOp::Add))
            .op(SetUpvalue(0))
            .op(Return);

        let mut outer = FunctionBuilder::new("outer");
        let inner = outer.fun_const(counter);
        let zero = outer.num_const(0.0);
        outer
            .op(Constant(zero))
            .op(NewClosure(inner))
            .op(CaptureLocal(1))
            .op(Return);

        let mut main = FunctionBuilder::new("<main>");
        let outer_c = main.fun_const(outer);
        let x = main.str_const("x");
        main.op(NewClosure(outer_c))
            .op(Call(0))
            .op(DefineGlobal(x))
            .op(GetGlobal(x))
            .op(Call(0))
            .op(Pop)
            .op(GetGlobal(x))
            .op(Call(0))
            .op(Pop)
            .op(GetGlobal(x))
            .op(Call(0))
            .op(Return);
        main
    }

    #[test]
    fn test_closure_counter() {
        let mut vm = new_vm();
        assert_eq!(Ok(Value::Num(3.0)), run(&mut vm, &counter_program()));
    }

    #[test]
    fn test_closure_counter_under_gc_pressure() {
        let mut vm = new_gc_stressed_vm();
        assert_eq!(Ok(Value::Num(3.0)), run(&mut vm, &counter_program()));
    }

    // Two closures capturing the same local share writes, also after the
    // capturing scope has exited and the upvalue is closed.
    #[test]
    fn test_upvalue_sharing_after_close() {
        let mut setter = FunctionBuilder::new("setter");
        let ten = setter.num_const(10.0);
        setter
            .op(Constant(ten))
            .op(SetUpvalue(0))
            .op(Pop)
            .op(Null)
            .op(Return);

        let mut getter = FunctionBuilder::new("getter");
        getter.op(GetUpvalue(0)).op(Return);

        let mut outer = FunctionBuilder::new("outer");
        let setter_c = outer.fun_const(setter);
        let getter_c = outer.fun_const(getter);
        let zero = outer.num_const(0.0);
        outer
            .op(Constant(zero))
            .op(NewClosure(setter_c))
            .op(CaptureLocal(1))
            .op(NewClosure(getter_c))
            .op(CaptureLocal(1))
            .op(NewTuple(2))
            .op(Return);

        let mut main = FunctionBuilder::new("<main>");
        let outer_c = main.fun_const(outer);
        let s = main.str_const("s");
        let g = main.str_const("g");
        main.op(NewClosure(outer_c))
            .op(Call(0))
            .op(Unpack(2))
            .op(DefineGlobal(g))
            .op(DefineGlobal(s))
            .op(GetGlobal(s))
            .op(Call(0))
            .op(Pop)
            .op(GetGlobal(g))
            .op(Call(0))
            .op(Return);

        let mut vm = new_vm();
        assert_eq!(Ok(Value::Num(10.0)), run(&mut vm, &main));
    }

    // ===== Exceptions ===== //

    // try raise Exception("boom")
    // except Exception e record(e.message())
    // ensure record("done") end
    //
    // `except_class` parameterizes the class tested by the handler so the
    // no-match path can be exercised with the same layout.
    fn try_except_ensure_program(except_class: &str) -> FunctionBuilder {
        let mut m = FunctionBuilder::new("<main>");
        let c_exc = m.str_const("Exception");
        let c_boom = m.str_const("boom");
        let c_record = m.str_const("record");
        let c_e = m.str_const("e");
        let c_message = m.str_const("message");
        let c_done = m.str_const("done");
        let c_match = m.str_const(except_class);
        m.op(SetupEnsure(26)) //  0: ensure handler -> 27
            .op(SetupExcept(8)) //  1: except handler -> 10
            .op(GetGlobal(c_exc)) //  2
            .op(Constant(c_boom)) //  3
            .op(Call(1)) //  4
            .op(Raise) //  5
            .op(PopHandler) //  6: normal path
            .op(Null) //  7
            .op(Null) //  8
            .op(Jump(13)) //  9: -> 23
            .op(GetLocal(1)) // 10: except target; [exc, cause]
            .op(GetGlobal(c_match)) // 11
            .op(Is) // 12
            .op(JumpIfFalse(9)) // 13: no match -> 23
            .op(Pop) // 14: drop cause
            .op(DefineGlobal(c_e)) // 15: bind e
            .op(GetGlobal(c_record)) // 16
            .op(GetGlobal(c_e)) // 17
            .op(Invoke(c_message, 0)) // 18
            .op(Call(1)) // 19
            .op(Pop) // 20
            .op(Null) // 21
            .op(Null) // 22
            .op(EndTry) // 23: except join
            .op(PopHandler) // 24: pop ensure, normal path
            .op(Null) // 25
            .op(Null) // 26
            .op(GetGlobal(c_record)) // 27: ensure target
            .op(Constant(c_done)) // 28
            .op(Call(1)) // 29
            .op(Pop) // 30
            .op(EndTry) // 31: ensure join
            .op(Null) // 32
            .op(Return); // 33
        m
    }

    #[test]
    fn test_try_except_ensure_ordering() {
        let mut vm = new_vm();
        with_record(&mut vm);
        assert_eq!(Ok(Value::Null), run(&mut vm, &try_except_ensure_program("Exception")));
        assert_eq!(vec!["boom", "done"], recorded(&mut vm));
    }

    #[test]
    fn test_try_except_ensure_under_gc_pressure() {
        let mut vm = new_gc_stressed_vm();
        with_record(&mut vm);
        assert_eq!(Ok(Value::Null), run(&mut vm, &try_except_ensure_program("Exception")));
        assert_eq!(vec!["boom", "done"], recorded(&mut vm));
    }

    // The handler tests for TypeException, the raise is a plain Exception:
    // the except body is skipped, the ensure still runs, the exception
    // escapes.
    #[test]
    fn test_except_no_match_still_runs_ensure() {
        let mut vm = new_vm();
        with_record(&mut vm);
        let err = run(&mut vm, &try_except_ensure_program("TypeException")).unwrap_err();
        assert!(err.contains("Exception: boom"), "{}", err);
        assert_eq!(vec!["done"], recorded(&mut vm));
    }

    // fun f() try return 7 ensure record("ensured") end end
    #[test]
    fn test_ensure_runs_on_return() {
        let mut f = FunctionBuilder::new("f");
        let seven = f.num_const(7.0);
        let c_record = f.str_const("record");
        let c_ensured = f.str_const("ensured");
        f.op(SetupEnsure(5)) //  0: -> 6
            .op(Constant(seven)) //  1
            .op(Return) //  2: runs the ensure first
            .op(PopHandler) //  3: normal path
            .op(Null) //  4
            .op(Null) //  5
            .op(GetGlobal(c_record)) //  6: ensure target
            .op(Constant(c_ensured)) //  7
            .op(Call(1)) //  8
            .op(Pop) //  9
            .op(EndTry) // 10: cause is Return -> resume returning
            .op(Null) // 11
            .op(Return); // 12

        let mut main = FunctionBuilder::new("<main>");
        let fc = main.fun_const(f);
        main.op(NewClosure(fc)).op(Call(0)).op(Return);

        let mut vm = new_vm();
        with_record(&mut vm);
        assert_eq!(Ok(Value::Num(7.0)), run(&mut vm, &main));
        assert_eq!(vec!["ensured"], recorded(&mut vm));
    }

    // An exception raised inside an ensure replaces the in-flight one.
    #[test]
    fn test_ensure_replaces_exception() {
        let mut m = FunctionBuilder::new("<main>");
        let c_exc = m.str_const("Exception");
        let c_first = m.str_const("first");
        let c_second = m.str_const("second");
        m.op(SetupEnsure(7)) //  0: -> 8
            .op(GetGlobal(c_exc)) //  1
            .op(Constant(c_first)) //  2
            .op(Call(1)) //  3
            .op(Raise) //  4
            .op(PopHandler) //  5
            .op(Null) //  6
            .op(Null) //  7
            .op(GetGlobal(c_exc)) //  8: ensure target
            .op(Constant(c_second)) //  9
            .op(Call(1)) // 10
            .op(Raise) // 11
            .op(EndTry) // 12
            .op(Null) // 13
            .op(Return); // 14

        let mut vm = new_vm();
        let err = run(&mut vm, &m).unwrap_err();
        assert!(err.contains("Exception: second"), "{}", err);
    }

    // Exceptions raised by a native unwind through the native frame and are
    // catchable like any other raise.
    #[test]
    fn test_catch_exception_from_native() {
        let mut m = FunctionBuilder::new("<main>");
        let c_get = m.str_const("__get__");
        let c_caught = m.str_const("caught");
        let zero = m.num_const(0.0);
        m.op(SetupExcept(4)) // 0: -> 5
            .op(NewList) // 1
            .op(Constant(zero)) // 2
            .op(Invoke(c_get, 1)) // 3: index 0 of [] raises
            .op(PopHandler) // 4
            .op(Pop) // 5: except target, drop cause
            .op(Pop) // 6: drop exception
            .op(Constant(c_caught)) // 7
            .op(Return); // 8

        let mut vm = new_vm();
        let v = run(&mut vm, &m).unwrap();
        assert_eq!(Some(String::from("caught")), vm.str_value(v));
    }

    #[test]
    fn test_uncaught_native_raise_records_native_frame() {
        let mut m = FunctionBuilder::new("<main>");
        let c_get = m.str_const("__get__");
        let zero = m.num_const(0.0);
        m.op(NewList).op(Constant(zero)).op(Invoke(c_get, 1)).op(Return);

        let mut vm = new_vm();
        let err = run(&mut vm, &m).unwrap_err();
        assert!(err.contains("TypeException"), "{}", err);
        assert!(err.contains("[native] module __core__, in __get__"), "{}", err);
    }

    // Users may subclass Exception; instances of the subclass match an
    // except testing for any ancestor.
    #[test]
    fn test_user_exception_subclass() {
        let mut m = FunctionBuilder::new("<main>");
        let c_exc = m.str_const("Exception");
        let c_myerr = m.str_const("MyErr");
        let c_oops = m.str_const("oops");
        let c_message = m.str_const("message");
        m.op(GetGlobal(c_exc)) // 0
            .op(NewSubclass(c_myerr)) // 1
            .op(DefineGlobal(c_myerr)) // 2
            .op(SetupExcept(4)) // 3: -> 8
            .op(GetGlobal(c_myerr)) // 4
            .op(Constant(c_oops)) // 5
            .op(Call(1)) // 6
            .op(Raise) // 7
            .op(Pop) // 8: except target, drop cause
            .op(Invoke(c_message, 0)) // 9
            .op(Return); // 10

        let mut vm = new_vm();
        let v = run(&mut vm, &m).unwrap();
        assert_eq!(Some(String::from("oops")), vm.str_value(v));
    }

    #[test]
    fn test_raise_requires_exception_instance() {
        let mut m = FunctionBuilder::new("<main>");
        let one = m.num_const(1.0);
        m.op(Constant(one)).op(Raise).op(Return);
        let mut vm = new_vm();
        let err = run(&mut vm, &m).unwrap_err();
        assert!(err.contains("Can only raise Exception instances"), "{}", err);
    }

    #[test]
    fn test_stack_trace_lines() {
        let mut f = FunctionBuilder::new("thrower");
        let c_exc = f.str_const("Exception");
        let c_bad = f.str_const("bad");
        f.line(4)
            .op(GetGlobal(c_exc))
            .op(Constant(c_bad))
            .op(Call(1))
            .op(Raise)
            .op(Return);

        let mut main = FunctionBuilder::new("<main>");
        let fc = main.fun_const(f);
        main.line(9).op(NewClosure(fc)).op(Call(0)).op(Return);

        let mut vm = new_vm();
        let err = run(&mut vm, &main).unwrap_err();
        assert!(err.contains("[line 9] module __main__, in <main>"), "{}", err);
        assert!(err.contains("[line 4] module __main__, in thrower"), "{}", err);
        assert!(err.contains("Exception: bad"), "{}", err);
    }

    // ===== Classes, methods, super ===== //

    // class A fun f() return 1 end end
    // class B is A fun f() return super.f() + 2 end end
    // B().f()  =>  3
    fn super_dispatch_program() -> FunctionBuilder {
        let mut fa = FunctionBuilder::new("f");
        fa.add_const(Const::Null); // slot 0: superclass, patched by DefMethod
        let one = fa.num_const(1.0);
        fa.op(Constant(one)).op(Return);

        let mut fb = FunctionBuilder::new("f");
        fb.add_const(Const::Null);
        let c_f = fb.str_const("f");
        let two = fb.num_const(2.0);
        fb.op(GetLocal(0))
            .op(Super(c_f, 0))
            .op(Constant(two))
            .op(Binary(BinaryOp::Add))
            .op(Return);

        let mut main = FunctionBuilder::new("<main>");
        let c_a = main.str_const("A");
        let fa_c = main.fun_const(fa);
        let c_f = main.str_const("f");
        let c_b = main.str_const("B");
        let fb_c = main.fun_const(fb);
        main.op(NewClass(c_a))
            .op(NewClosure(fa_c))
            .op(DefMethod(c_f))
            .op(DefineGlobal(c_a))
            .op(GetGlobal(c_a))
            .op(NewSubclass(c_b))
            .op(NewClosure(fb_c))
            .op(DefMethod(c_f))
            .op(DefineGlobal(c_b))
            .op(GetGlobal(c_b))
            .op(Call(0))
            .op(Invoke(c_f, 0))
            .op(Return);
        main
    }

    #[test]
    fn test_super_dispatch() {
        let mut vm = new_vm();
        assert_eq!(Ok(Value::Num(3.0)), run(&mut vm, &super_dispatch_program()));
    }

    #[test]
    fn test_super_dispatch_under_gc_pressure() {
        let mut vm = new_gc_stressed_vm();
        assert_eq!(Ok(Value::Num(3.0)), run(&mut vm, &super_dispatch_program()));
    }

    #[test]
    fn test_is_walks_superclass_chain() {
        let mut m = FunctionBuilder::new("<main>");
        let c_a = m.str_const("A");
        let c_b = m.str_const("B");
        m.op(NewClass(c_a))
            .op(DefineGlobal(c_a))
            .op(GetGlobal(c_a))
            .op(NewSubclass(c_b))
            .op(DefineGlobal(c_b))
            .op(GetGlobal(c_b))
            .op(Call(0))
            .op(GetGlobal(c_a))
            .op(Is)
            .op(Return);
        let mut vm = new_vm();
        assert_eq!(Ok(Value::Bool(true)), run(&mut vm, &m));
    }

    #[test]
    fn test_is_requires_class() {
        let mut m = FunctionBuilder::new("<main>");
        let one = m.num_const(1.0);
        let two = m.num_const(2.0);
        m.op(Constant(one)).op(Constant(two)).op(Is).op(Return);
        let mut vm = new_vm();
        let err = run(&mut vm, &m).unwrap_err();
        assert!(err.contains("must be a class"), "{}", err);
    }

    // inst.m resolves to the field when a field shadows the method, while a
    // previously bound method keeps its original receiver and callable.
    #[test]
    fn test_field_shadows_method_and_bound_method_is_stable() {
        let mut method = FunctionBuilder::new("m");
        method.add_const(Const::Null);
        let five = method.num_const(5.0);
        method.op(Constant(five)).op(Return);

        let mut shadow = FunctionBuilder::new("shadow");
        let seven = shadow.num_const(7.0);
        shadow.op(Constant(seven)).op(Return);

        let mut main = FunctionBuilder::new("<main>");
        let c_c = main.str_const("C");
        let m_c = main.fun_const(method);
        let c_m = main.str_const("m");
        let c_i = main.str_const("i");
        let shadow_c = main.fun_const(shadow);
        let c_x = main.str_const("x");
        main.op(NewClass(c_c))
            .op(NewClosure(m_c))
            .op(DefMethod(c_m))
            .op(DefineGlobal(c_c))
            .op(GetGlobal(c_c))
            .op(Call(0))
            .op(DefineGlobal(c_i))
            // x = i.m (binds the method)
            .op(GetGlobal(c_i))
            .op(GetField(c_m))
            .op(DefineGlobal(c_x))
            // i.m = fun() return 7 end
            .op(NewClosure(shadow_c))
            .op(GetGlobal(c_i))
            .op(SetField(c_m))
            .op(Pop)
            // (i.m(), x())
            .op(GetGlobal(c_i))
            .op(Invoke(c_m, 0))
            .op(GetGlobal(c_x))
            .op(Call(0))
            .op(NewTuple(2))
            .op(Return);

        let mut vm = new_vm();
        let v = run(&mut vm, &main).unwrap();
        assert_eq!(vec![7.0, 5.0], nums(&vm, v));
    }

    #[test]
    fn test_missing_method_raises() {
        let mut m = FunctionBuilder::new("<main>");
        let c_d = m.str_const("D");
        let c_nope = m.str_const("nope");
        m.op(NewClass(c_d)).op(Call(0)).op(Invoke(c_nope, 0)).op(Return);
        let mut vm = new_vm();
        let err = run(&mut vm, &m).unwrap_err();
        assert!(err.contains("MethodException"), "{}", err);
        assert!(err.contains("D.nope() doesn't exist"), "{}", err);
    }

    #[test]
    fn test_missing_field_raises() {
        let mut m = FunctionBuilder::new("<main>");
        let c_d = m.str_const("D");
        let c_nope = m.str_const("nope");
        m.op(NewClass(c_d)).op(Call(0)).op(GetField(c_nope)).op(Return);
        let mut vm = new_vm();
        let err = run(&mut vm, &m).unwrap_err();
        assert!(err.contains("FieldException"), "{}", err);
    }

    #[test]
    fn test_non_instantiable_builtin() {
        let mut m = FunctionBuilder::new("<main>");
        let c_table = m.str_const("Table");
        m.op(GetGlobal(c_table)).op(Call(0)).op(Return);
        let mut vm = new_vm();
        let err = run(&mut vm, &m).unwrap_err();
        assert!(err.contains("can't be directly instantiated"), "{}", err);
    }

    #[test]
    fn test_cannot_subclass_builtin() {
        let mut m = FunctionBuilder::new("<main>");
        let c_list = m.str_const("List");
        let c_my = m.str_const("MyList");
        m.op(GetGlobal(c_list)).op(NewSubclass(c_my)).op(Return);
        let mut vm = new_vm();
        let err = run(&mut vm, &m).unwrap_err();
        assert!(err.contains("Cannot subclass builtin class List"), "{}", err);
    }

    #[test]
    fn test_calling_non_callable() {
        let mut m = FunctionBuilder::new("<main>");
        let one = m.num_const(1.0);
        m.op(Constant(one)).op(Call(0)).op(Return);
        let mut vm = new_vm();
        let err = run(&mut vm, &m).unwrap_err();
        assert!(err.contains("Object Number is not a callable"), "{}", err);
    }

    // ===== Operators ===== //

    #[test]
    fn test_arithmetic_fast_path() {
        let cases: &[(BinaryOp, f64, f64, Value)] = &[
            (BinaryOp::Add, 3.0, 4.0, Value::Num(7.0)),
            (BinaryOp::Mod, 10.0, 3.0, Value::Num(1.0)),
            (BinaryOp::Pow, 2.0, 3.0, Value::Num(8.0)),
            (BinaryOp::LessThan, 1.0, 2.0, Value::Bool(true)),
            (BinaryOp::Equal, 2.0, 2.0, Value::Bool(true)),
        ];
        for &(op, a, b, expected) in cases {
            let mut m = FunctionBuilder::new("<main>");
            let ca = m.num_const(a);
            let cb = m.num_const(b);
            m.op(Constant(ca)).op(Constant(cb)).op(Binary(op)).op(Return);
            let mut vm = new_vm();
            assert_eq!(Ok(expected), run(&mut vm, &m));
        }
    }

    #[test]
    fn test_unary_operators() {
        let mut m = FunctionBuilder::new("<main>");
        let five = m.num_const(5.0);
        m.op(Constant(five)).op(Unary(UnaryOp::Neg)).op(Return);
        let mut vm = new_vm();
        assert_eq!(Ok(Value::Num(-5.0)), run(&mut vm, &m));

        let mut m = FunctionBuilder::new("<main>");
        let zero = m.num_const(0.0);
        m.op(Constant(zero)).op(Unary(UnaryOp::Not)).op(Return);
        let mut vm = new_vm();
        // 0 is truthy, so `not 0` is false.
        assert_eq!(Ok(Value::Bool(false)), run(&mut vm, &m));
    }

    #[test]
    fn test_string_concat_interns() {
        let mut m = FunctionBuilder::new("<main>");
        let a = m.str_const("foo");
        let b = m.str_const("bar");
        m.op(Constant(a)).op(Constant(b)).op(Binary(BinaryOp::Add)).op(Return);
        let mut vm = new_vm();
        let v = run(&mut vm, &m).unwrap();
        assert_eq!(Some(String::from("foobar")), vm.str_value(v));
        // The result is interned: re-interning the same bytes yields the
        // same handle.
        assert_eq!(Value::Obj(vm.intern("foobar")), v);
    }

    fn overload_class_prefix(m: &mut FunctionBuilder) -> u16 {
        let mut add = FunctionBuilder::new("__add__");
        add.arity = 1;
        add.add_const(Const::Null);
        let v = add.num_const(42.0);
        add.op(Constant(v)).op(Return);

        let mut radd = FunctionBuilder::new("__radd__");
        radd.arity = 1;
        radd.add_const(Const::Null);
        let v = radd.num_const(43.0);
        radd.op(Constant(v)).op(Return);

        let c_v = m.str_const("V");
        let add_c = m.fun_const(add);
        let c_add = m.str_const("__add__");
        let radd_c = m.fun_const(radd);
        let c_radd = m.str_const("__radd__");
        m.op(NewClass(c_v))
            .op(NewClosure(add_c))
            .op(DefMethod(c_add))
            .op(NewClosure(radd_c))
            .op(DefMethod(c_radd))
            .op(DefineGlobal(c_v));
        c_v
    }

    #[test]
    fn test_add_overload_forward() {
        let mut m = FunctionBuilder::new("<main>");
        let c_v = overload_class_prefix(&mut m);
        let one = m.num_const(1.0);
        m.op(GetGlobal(c_v))
            .op(Call(0))
            .op(Constant(one))
            .op(Binary(BinaryOp::Add))
            .op(Return);
        let mut vm = new_vm();
        assert_eq!(Ok(Value::Num(42.0)), run(&mut vm, &m));
    }

    #[test]
    fn test_add_overload_reverse() {
        let mut m = FunctionBuilder::new("<main>");
        let c_v = overload_class_prefix(&mut m);
        let one = m.num_const(1.0);
        m.op(Constant(one))
            .op(GetGlobal(c_v))
            .op(Call(0))
            .op(Binary(BinaryOp::Add))
            .op(Return);
        let mut vm = new_vm();
        assert_eq!(Ok(Value::Num(43.0)), run(&mut vm, &m));
    }

    #[test]
    fn test_add_without_overload_raises() {
        let mut m = FunctionBuilder::new("<main>");
        let c_p = m.str_const("P");
        let one = m.num_const(1.0);
        m.op(NewClass(c_p))
            .op(DefineGlobal(c_p))
            .op(Constant(one))
            .op(GetGlobal(c_p))
            .op(Call(0))
            .op(Binary(BinaryOp::Add))
            .op(Return);
        let mut vm = new_vm();
        let err = run(&mut vm, &m).unwrap_err();
        assert!(err.contains("Operator + not defined for types Number, P"), "{}", err);
    }

    #[test]
    fn test_equality_identity_and_scalars() {
        let mut m = FunctionBuilder::new("<main>");
        let c_d = m.str_const("D");
        let c_i = m.str_const("i");
        let one = m.num_const(1.0);
        m.op(NewClass(c_d))
            .op(DefineGlobal(c_d))
            .op(GetGlobal(c_d))
            .op(Call(0))
            .op(DefineGlobal(c_i))
            // i == i: identity through Object.__eq__
            .op(GetGlobal(c_i))
            .op(GetGlobal(c_i))
            .op(Binary(BinaryOp::Equal))
            // i == D(): different instances
            .op(GetGlobal(c_i))
            .op(GetGlobal(c_d))
            .op(Call(0))
            .op(Binary(BinaryOp::Equal))
            // 1 == i: scalar left, primitive equality
            .op(Constant(one))
            .op(GetGlobal(c_i))
            .op(Binary(BinaryOp::Equal))
            .op(NewTuple(3))
            .op(Return);

        let mut vm = new_vm();
        let v = run(&mut vm, &m).unwrap();
        let values = vm.sequence_values(v).unwrap();
        assert_eq!(vec![Value::Bool(true), Value::Bool(false), Value::Bool(false)], values);
    }

    #[test]
    fn test_pow_requires_numbers() {
        let mut m = FunctionBuilder::new("<main>");
        let s = m.str_const("a");
        let one = m.num_const(1.0);
        m.op(Constant(s)).op(Constant(one)).op(Binary(BinaryOp::Pow)).op(Return);
        let mut vm = new_vm();
        let err = run(&mut vm, &m).unwrap_err();
        assert!(err.contains("Operands of `^` must be numbers"), "{}", err);
    }

    #[test]
    fn test_neg_overload() {
        let mut neg = FunctionBuilder::new("__neg__");
        neg.add_const(Const::Null);
        let v = neg.num_const(99.0);
        neg.op(Constant(v)).op(Return);

        let mut m = FunctionBuilder::new("<main>");
        let c_n = m.str_const("N");
        let neg_c = m.fun_const(neg);
        let c_negname = m.str_const("__neg__");
        m.op(NewClass(c_n))
            .op(NewClosure(neg_c))
            .op(DefMethod(c_negname))
            .op(DefineGlobal(c_n))
            .op(GetGlobal(c_n))
            .op(Call(0))
            .op(Unary(UnaryOp::Neg))
            .op(Return);
        let mut vm = new_vm();
        assert_eq!(Ok(Value::Num(99.0)), run(&mut vm, &m));
    }

    // ===== Subscript ===== //

    #[test]
    fn test_list_subscript_fast_path() {
        let mut m = FunctionBuilder::new("<main>");
        let ten = m.num_const(10.0);
        let twenty = m.num_const(20.0);
        let one = m.num_const(1.0);
        m.op(NewList)
            .op(Constant(ten))
            .op(AppendList)
            .op(Constant(twenty))
            .op(AppendList)
            .op(Constant(one))
            .op(GetIndex)
            .op(Return);
        let mut vm = new_vm();
        assert_eq!(Ok(Value::Num(20.0)), run(&mut vm, &m));
    }

    #[test]
    fn test_list_subscript_store() {
        let mut m = FunctionBuilder::new("<main>");
        let ten = m.num_const(10.0);
        let ninety = m.num_const(99.0);
        let zero = m.num_const(0.0);
        let c_l = m.str_const("l");
        m.op(NewList)
            .op(Constant(ten))
            .op(AppendList)
            .op(DefineGlobal(c_l))
            .op(Constant(ninety)) // value
            .op(Constant(zero)) // index
            .op(GetGlobal(c_l)) // operand
            .op(SetIndex)
            .op(Pop)
            .op(GetGlobal(c_l))
            .op(Constant(zero))
            .op(GetIndex)
            .op(Return);
        let mut vm = new_vm();
        assert_eq!(Ok(Value::Num(99.0)), run(&mut vm, &m));
    }

    #[test]
    fn test_subscript_out_of_bounds() {
        let mut m = FunctionBuilder::new("<main>");
        let five = m.num_const(5.0);
        m.op(NewList).op(Constant(five)).op(GetIndex).op(Return);
        let mut vm = new_vm();
        let err = run(&mut vm, &m).unwrap_err();
        assert!(err.contains("out of bounds"), "{}", err);
    }

    #[test]
    fn test_subscript_requires_integer() {
        let mut m = FunctionBuilder::new("<main>");
        let half = m.num_const(0.5);
        let ten = m.num_const(10.0);
        m.op(NewList).op(Constant(ten)).op(AppendList).op(Constant(half)).op(GetIndex).op(Return);
        let mut vm = new_vm();
        let err = run(&mut vm, &m).unwrap_err();
        assert!(err.contains("must be an integer"), "{}", err);
    }

    #[test]
    fn test_string_subscript() {
        let mut m = FunctionBuilder::new("<main>");
        let s = m.str_const("abc");
        let one = m.num_const(1.0);
        m.op(Constant(s)).op(Constant(one)).op(GetIndex).op(Return);
        let mut vm = new_vm();
        let v = run(&mut vm, &m).unwrap();
        assert_eq!(Some(String::from("b")), vm.str_value(v));
    }

    #[test]
    fn test_table_subscript_through_overloads() {
        let mut m = FunctionBuilder::new("<main>");
        let c_t = m.str_const("t");
        let c_k = m.str_const("k");
        let five = m.num_const(5.0);
        m.op(NewTable)
            .op(DefineGlobal(c_t))
            .op(Constant(five)) // value
            .op(Constant(c_k)) // index
            .op(GetGlobal(c_t)) // operand
            .op(SetIndex)
            .op(Pop)
            .op(GetGlobal(c_t))
            .op(Constant(c_k))
            .op(GetIndex)
            .op(Return);
        let mut vm = new_vm();
        assert_eq!(Ok(Value::Num(5.0)), run(&mut vm, &m));
    }

    // ===== Iteration ===== //

    // var s = ""; for i in [0, 1, 2] do s = s + i.__string__() end; s
    fn string_loop_program() -> FunctionBuilder {
        let mut m = FunctionBuilder::new("<main>");
        let empty = m.str_const("");
        let c_s = m.str_const("s");
        let n0 = m.num_const(0.0);
        let n1 = m.num_const(1.0);
        let n2 = m.num_const(2.0);
        let c_string = m.str_const("__string__");
        let c_v = m.str_const("v");
        m.op(Constant(empty)) //  0
            .op(DefineGlobal(c_s)) //  1
            .op(NewList) //  2
            .op(Constant(n0)) //  3
            .op(AppendList) //  4
            .op(Constant(n1)) //  5
            .op(AppendList) //  6
            .op(Constant(n2)) //  7
            .op(AppendList) //  8
            .op(Null) //  9: iterator state
            .op(ForIter) // 10: loop head
            .op(ForNext(8)) // 11: exit -> 20
            .op(DefineGlobal(c_v)) // 12
            .op(GetGlobal(c_s)) // 13
            .op(GetGlobal(c_v)) // 14
            .op(Invoke(c_string, 0)) // 15
            .op(Binary(BinaryOp::Add)) // 16
            .op(SetGlobal(c_s)) // 17
            .op(Pop) // 18
            .op(Jump(-10)) // 19: back to 10
            .op(Pop) // 20: iterator
            .op(Pop) // 21: sequence
            .op(GetGlobal(c_s)) // 22
            .op(Return); // 23
        m
    }

    #[test]
    fn test_for_loop_builds_string() {
        let mut vm = new_vm();
        let v = run(&mut vm, &string_loop_program()).unwrap();
        assert_eq!(Some(String::from("012")), vm.str_value(v));
    }

    #[test]
    fn test_for_loop_under_gc_pressure() {
        let mut vm = new_gc_stressed_vm();
        let v = run(&mut vm, &string_loop_program()).unwrap();
        assert_eq!(Some(String::from("012")), vm.str_value(v));
    }

    // ===== Unpacking ===== //

    #[test]
    fn test_tuple_unpack() {
        let mut m = FunctionBuilder::new("<main>");
        let n1 = m.num_const(1.0);
        let n2 = m.num_const(2.0);
        let n3 = m.num_const(3.0);
        let c_a = m.str_const("a");
        let c_b = m.str_const("b");
        let c_c = m.str_const("c");
        m.op(Constant(n1))
            .op(Constant(n2))
            .op(Constant(n3))
            .op(NewTuple(3))
            .op(Unpack(3))
            .op(DefineGlobal(c_c))
            .op(DefineGlobal(c_b))
            .op(DefineGlobal(c_a))
            .op(NewList)
            .op(GetGlobal(c_a))
            .op(AppendList)
            .op(GetGlobal(c_b))
            .op(AppendList)
            .op(GetGlobal(c_c))
            .op(AppendList)
            .op(Return);
        let mut vm = new_vm();
        let v = run(&mut vm, &m).unwrap();
        assert_eq!(vec![1.0, 2.0, 3.0], nums(&vm, v));
    }

    #[test]
    fn test_unpack_arity_mismatch() {
        let mut m = FunctionBuilder::new("<main>");
        let n1 = m.num_const(1.0);
        let n2 = m.num_const(2.0);
        let n3 = m.num_const(3.0);
        m.op(Constant(n1))
            .op(Constant(n2))
            .op(Constant(n3))
            .op(NewTuple(3))
            .op(Unpack(2))
            .op(Return);
        let mut vm = new_vm();
        let err = run(&mut vm, &m).unwrap_err();
        assert!(err.contains("TypeException"), "{}", err);
        assert!(err.contains("too few values to unpack"), "{}", err);
    }

    #[test]
    fn test_unpack_requires_sequence() {
        let mut m = FunctionBuilder::new("<main>");
        let one = m.num_const(1.0);
        m.op(Constant(one)).op(Unpack(1)).op(Return);
        let mut vm = new_vm();
        let err = run(&mut vm, &m).unwrap_err();
        assert!(err.contains("Can unpack only Tuple or List"), "{}", err);
    }

    // ===== Argument adjustment ===== //

    // fun g(a, b = 2, c = 3) return (a, b, c) end
    fn defaults_fn() -> FunctionBuilder {
        let mut g = FunctionBuilder::new("g");
        g.arity = 3;
        g.add_default(Const::Num(2.0));
        g.add_default(Const::Num(3.0));
        g.op(GetLocal(1))
            .op(GetLocal(2))
            .op(GetLocal(3))
            .op(NewTuple(3))
            .op(Return);
        g
    }

    #[test]
    fn test_defaults_materialized_positionally() {
        let mut m = FunctionBuilder::new("<main>");
        let g = m.fun_const(defaults_fn());
        let one = m.num_const(1.0);
        m.op(NewClosure(g)).op(Constant(one)).op(Call(1)).op(Return);
        let mut vm = new_vm();
        let v = run(&mut vm, &m).unwrap();
        assert_eq!(vec![1.0, 2.0, 3.0], nums(&vm, v));
    }

    #[test]
    fn test_too_few_arguments() {
        let mut m = FunctionBuilder::new("<main>");
        let g = m.fun_const(defaults_fn());
        m.op(NewClosure(g)).op(Call(0)).op(Return);
        let mut vm = new_vm();
        let err = run(&mut vm, &m).unwrap_err();
        assert!(err.contains("takes at least 1 arguments, 0 supplied"), "{}", err);
    }

    #[test]
    fn test_too_many_arguments() {
        let mut m = FunctionBuilder::new("<main>");
        let g = m.fun_const(defaults_fn());
        let one = m.num_const(1.0);
        m.op(NewClosure(g))
            .op(Constant(one))
            .op(Constant(one))
            .op(Constant(one))
            .op(Constant(one))
            .op(Call(4))
            .op(Return);
        let mut vm = new_vm();
        let err = run(&mut vm, &m).unwrap_err();
        assert!(err.contains("takes at most 3 arguments, 4 supplied"), "{}", err);
    }

    #[test]
    fn test_exact_arguments() {
        let mut e = FunctionBuilder::new("e");
        e.arity = 1;
        e.op(GetLocal(1)).op(Return);

        let mut m = FunctionBuilder::new("<main>");
        let e_c = m.fun_const(e);
        m.op(NewClosure(e_c)).op(Call(0)).op(Return);
        let mut vm = new_vm();
        let err = run(&mut vm, &m).unwrap_err();
        assert!(err.contains("takes exactly 1 arguments, 0 supplied"), "{}", err);
    }

    #[test]
    fn test_varargs_collected_into_tuple() {
        let mut v = FunctionBuilder::new("v");
        v.arity = 1;
        v.vararg = true;
        v.op(GetLocal(2)).op(Return);

        let mut m = FunctionBuilder::new("<main>");
        let v_c = m.fun_const(v);
        let n9 = m.num_const(9.0);
        let n8 = m.num_const(8.0);
        let n7 = m.num_const(7.0);
        m.op(NewClosure(v_c))
            .op(Constant(n9))
            .op(Constant(n8))
            .op(Constant(n7))
            .op(Call(3))
            .op(Return);
        let mut vm = new_vm();
        let result = run(&mut vm, &m).unwrap();
        assert_eq!(vec![8.0, 7.0], nums(&vm, result));
    }

    #[test]
    fn test_varargs_empty() {
        let mut v = FunctionBuilder::new("v");
        v.arity = 1;
        v.vararg = true;
        v.op(GetLocal(2)).op(Return);

        let mut m = FunctionBuilder::new("<main>");
        let v_c = m.fun_const(v);
        let n9 = m.num_const(9.0);
        m.op(NewClosure(v_c)).op(Constant(n9)).op(Call(1)).op(Return);
        let mut vm = new_vm();
        let result = run(&mut vm, &m).unwrap();
        assert_eq!(Vec::<f64>::new(), nums(&vm, result));
    }

    // ===== Globals ===== //

    #[test]
    fn test_get_undefined_global() {
        let mut m = FunctionBuilder::new("<main>");
        let c = m.str_const("missing");
        m.op(GetGlobal(c)).op(Return);
        let mut vm = new_vm();
        let err = run(&mut vm, &m).unwrap_err();
        assert!(err.contains("NameException"), "{}", err);
        assert!(err.contains("`missing` is not defined"), "{}", err);
    }

    #[test]
    fn test_set_undefined_global() {
        let mut m = FunctionBuilder::new("<main>");
        let c = m.str_const("missing");
        let one = m.num_const(1.0);
        m.op(Constant(one)).op(SetGlobal(c)).op(Return);
        let mut vm = new_vm();
        let err = run(&mut vm, &m).unwrap_err();
        assert!(err.contains("NameException"), "{}", err);
    }

    // ===== Imports ===== //

    fn foo_module_bytes(vm: &mut VirtualMachine) -> Vec<u8> {
        let mut greet = FunctionBuilder::new("greet");
        let hi = greet.str_const("hi");
        greet.op(Constant(hi)).op(Return);

        let mut top = FunctionBuilder::new("foo");
        let greet_c = top.fun_const(greet);
        let c_greet = top.str_const("greet");
        let one = top.num_const(1.0);
        let c_loaded = top.str_const("loaded");
        top.op(NewClosure(greet_c))
            .op(DefineGlobal(c_greet))
            .op(Constant(one))
            .op(DefineGlobal(c_loaded))
            .op(Null)
            .op(Return);

        let main = vm.main_module;
        let fun = top.build(vm, main);
        let bytes = crate::vm::serialize::serialize_function(vm, fun).unwrap();
        vm.pop();
        bytes
    }

    #[test]
    fn test_import_executes_once() {
        let dir = std::env::temp_dir().join(format!("jstar-import-{}", std::process::id()));
        fs::create_dir_all(&dir).unwrap();

        let mut vm = new_vm();
        let bytes = foo_module_bytes(&mut vm);
        fs::write(dir.join("foo.jsb"), bytes).unwrap();
        vm.add_import_path(&dir);

        // import foo; foo.greet()
        let mut m = FunctionBuilder::new("<main>");
        let c_foo = m.str_const("foo");
        let c_greet = m.str_const("greet");
        m.op(Import(c_foo)).op(Pop).op(GetGlobal(c_foo)).op(Invoke(c_greet, 0)).op(Return);
        let v = run(&mut vm, &m).unwrap();
        assert_eq!(Some(String::from("hi")), vm.str_value(v));

        let foo = vm.find_module("foo").unwrap();
        assert_eq!(Some(Value::Num(1.0)), vm.get_global("foo", "loaded"));

        // Mutate module state, then re-import: top-level code must not run
        // again, and the registry must return the same module object.
        let c_loaded = vm.intern("loaded");
        vm.heap.as_module_mut(foo).globals.put(c_loaded, Value::Num(99.0));

        let mut m2 = FunctionBuilder::new("<main>");
        let c_foo = m2.str_const("foo");
        m2.op(Import(c_foo)).op(Pop).op(Null).op(Return);
        assert_eq!(Ok(Value::Null), run(&mut vm, &m2));

        assert_eq!(Some(foo), vm.find_module("foo"));
        assert_eq!(Some(Value::Num(99.0)), vm.get_global("foo", "loaded"));

        fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn test_import_as_and_import_name() {
        let dir = std::env::temp_dir().join(format!("jstar-import-as-{}", std::process::id()));
        fs::create_dir_all(&dir).unwrap();

        let mut vm = new_vm();
        let bytes = foo_module_bytes(&mut vm);
        fs::write(dir.join("foo.jsb"), bytes).unwrap();
        vm.add_import_path(&dir);

        // import foo as f; f.greet()
        let mut m = FunctionBuilder::new("<main>");
        let c_foo = m.str_const("foo");
        let c_f = m.str_const("f");
        let c_greet = m.str_const("greet");
        m.op(ImportAs(c_foo, c_f)).op(Pop).op(GetGlobal(c_f)).op(Invoke(c_greet, 0)).op(Return);
        let v = run(&mut vm, &m).unwrap();
        assert_eq!(Some(String::from("hi")), vm.str_value(v));

        // import greet from foo (no module binding by name)
        let mut m2 = FunctionBuilder::new("<main>");
        let c_foo = m2.str_const("foo");
        let c_greet = m2.str_const("greet");
        m2.op(ImportFrom(c_foo))
            .op(Pop)
            .op(ImportName(c_foo, c_greet))
            .op(GetGlobal(c_greet))
            .op(Call(0))
            .op(Return);
        let v = run(&mut vm, &m2).unwrap();
        assert_eq!(Some(String::from("hi")), vm.str_value(v));

        fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn test_import_star_skips_underscore_names() {
        let dir = std::env::temp_dir().join(format!("jstar-import-star-{}", std::process::id()));
        fs::create_dir_all(&dir).unwrap();

        let mut top = FunctionBuilder::new("bar");
        let one = top.num_const(1.0);
        let c_pub = top.str_const("visible");
        let two = top.num_const(2.0);
        let c_priv = top.str_const("_hidden");
        top.op(Constant(one))
            .op(DefineGlobal(c_pub))
            .op(Constant(two))
            .op(DefineGlobal(c_priv))
            .op(Null)
            .op(Return);

        let mut vm = new_vm();
        let main = vm.main_module;
        let fun = top.build(&mut vm, main);
        let bytes = crate::vm::serialize::serialize_function(&vm, fun).unwrap();
        vm.pop();
        fs::write(dir.join("bar.jsb"), bytes).unwrap();
        vm.add_import_path(&dir);

        let mut m = FunctionBuilder::new("<main>");
        let c_bar = m.str_const("bar");
        let c_star = m.str_const("*");
        m.op(ImportFrom(c_bar)).op(Pop).op(ImportName(c_bar, c_star)).op(Null).op(Return);
        assert_eq!(Ok(Value::Null), run(&mut vm, &m));

        assert_eq!(Some(Value::Num(1.0)), vm.get_global("__main__", "visible"));
        assert_eq!(None, vm.get_global("__main__", "_hidden"));

        fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn test_import_missing_module() {
        let mut vm = new_vm();
        let mut m = FunctionBuilder::new("<main>");
        let c = m.str_const("no_such_module");
        m.op(Import(c)).op(Pop).op(Return);
        let err = run(&mut vm, &m).unwrap_err();
        assert!(err.contains("ImportException"), "{}", err);
        assert!(err.contains("Cannot load module `no_such_module`"), "{}", err);
    }

    #[test]
    fn test_module_invoke_falls_back_to_module_class() {
        let dir = std::env::temp_dir().join(format!("jstar-modstr-{}", std::process::id()));
        fs::create_dir_all(&dir).unwrap();

        let mut vm = new_vm();
        let bytes = foo_module_bytes(&mut vm);
        fs::write(dir.join("foo.jsb"), bytes).unwrap();
        vm.add_import_path(&dir);

        let mut m = FunctionBuilder::new("<main>");
        let c_foo = m.str_const("foo");
        let c_string = m.str_const("__string__");
        m.op(Import(c_foo)).op(Pop).op(GetGlobal(c_foo)).op(Invoke(c_string, 0)).op(Return);
        let v = run(&mut vm, &m).unwrap();
        assert_eq!(Some(String::from("<module foo>")), vm.str_value(v));

        fs::remove_dir_all(&dir).ok();
    }

    // ===== Natives through bytecode ===== //

    fn twice_native(vm: &mut VirtualMachine) -> Result<(), Raised> {
        let n = vm.check_num_arg(1, "x")?;
        vm.push_num(n * 2.0);
        Ok(())
    }

    fn greet_native(vm: &mut VirtualMachine) -> Result<(), Raised> {
        vm.push_str("hello");
        Ok(())
    }

    #[test]
    fn test_native_opcode_resolution() {
        let mut vm = new_vm();
        vm.register_native("__main__", None, "twice", twice_native);

        let mut m = FunctionBuilder::new("<main>");
        let nat = m.add_const(Const::Native { name: String::from("twice"), arity: 1, vararg: false });
        let c_twice = m.str_const("twice");
        let n21 = m.num_const(21.0);
        m.op(Constant(nat))
            .op(Native(c_twice))
            .op(DefineGlobal(c_twice))
            .op(GetGlobal(c_twice))
            .op(Constant(n21))
            .op(Call(1))
            .op(Return);
        assert_eq!(Ok(Value::Num(42.0)), run(&mut vm, &m));
    }

    #[test]
    fn test_nat_method_resolution() {
        let mut vm = new_vm();
        vm.register_native("__main__", Some("Greeter"), "greet", greet_native);

        let mut m = FunctionBuilder::new("<main>");
        let c_cls = m.str_const("Greeter");
        let c_greet = m.str_const("greet");
        let nat = m.add_const(Const::Native { name: String::from("greet"), arity: 0, vararg: false });
        m.op(NewClass(c_cls))
            .op(NatMethod(c_greet, nat))
            .op(DefineGlobal(c_cls))
            .op(GetGlobal(c_cls))
            .op(Call(0))
            .op(Invoke(c_greet, 0))
            .op(Return);
        let v = run(&mut vm, &m).unwrap();
        assert_eq!(Some(String::from("hello")), vm.str_value(v));
    }

    #[test]
    fn test_unresolved_native_raises() {
        let mut vm = new_vm();
        let mut m = FunctionBuilder::new("<main>");
        let nat = m.add_const(Const::Native { name: String::from("nowhere"), arity: 0, vararg: false });
        let c = m.str_const("nowhere");
        m.op(Constant(nat)).op(Native(c)).op(Return);
        let err = run(&mut vm, &m).unwrap_err();
        assert!(err.contains("Cannot resolve native nowhere"), "{}", err);
    }

    // ===== Recursion limit and eval break ===== //

    #[test]
    fn test_stack_overflow() {
        let mut f = FunctionBuilder::new("f");
        let c_f = f.str_const("f");
        f.op(GetGlobal(c_f)).op(Call(0)).op(Return);

        let mut m = FunctionBuilder::new("<main>");
        let f_c = m.fun_const(f);
        let c_f = m.str_const("f");
        m.op(NewClosure(f_c))
            .op(DefineGlobal(c_f))
            .op(GetGlobal(c_f))
            .op(Call(0))
            .op(Return);
        let mut vm = new_vm();
        let err = run(&mut vm, &m).unwrap_err();
        assert!(err.contains("StackOverflowException"), "{}", err);
    }

    #[test]
    fn test_eval_break_interrupts_loop() {
        let mut m = FunctionBuilder::new("<main>");
        m.op(Jump(-1)); // spin forever
        let mut vm = new_vm();
        vm.eval_break_handle().store(true, std::sync::atomic::Ordering::Relaxed);
        let err = run(&mut vm, &m).unwrap_err();
        assert!(err.contains("evaluation interrupted"), "{}", err);
    }

    // ===== Serialization behavior ===== //

    #[test]
    fn test_serialized_program_behaves_identically() {
        let mut vm = new_vm();
        let main = vm.main_module;
        let fun = counter_program().build(&mut vm, main);
        let bytes = crate::vm::serialize::serialize_function(&vm, fun).unwrap();
        vm.pop();

        let mut loaded_vm = new_vm();
        let main = loaded_vm.main_module;
        crate::vm::serialize::deserialize_function(&mut loaded_vm, &bytes, main).unwrap();
        assert_eq!(Ok(Value::Num(3.0)), run_pushed(&mut loaded_vm));
    }

    // ===== Garbage collection ===== //

    #[test]
    fn test_gc_frees_unreachable_keeps_reachable() {
        let mut vm = new_vm();
        vm.push_list();
        let live = vm.peek(0).as_obj();

        for i in 0..100 {
            let s = vm.intern(&format!("garbage-{}", i));
            if i % 10 == 0 {
                vm.push(Value::Obj(s));
                vm.list_append(-2);
            }
        }

        let before = vm.heap.live_count();
        vm.collect_garbage();
        let after = vm.heap.live_count();
        assert!(after < before, "collected nothing: {} -> {}", before, after);

        // Everything reachable from the rooted list survived.
        assert!(vm.heap.is_live(live));
        let elems = vm.heap.as_list(live).clone();
        assert_eq!(10, elems.len());
        for v in &elems {
            assert!(vm.heap.is_live(v.as_obj()));
        }
        vm.pop();
    }

    #[test]
    fn test_interner_uniqueness_and_weakness() {
        let mut vm = new_vm();
        let a = vm.intern("some unique string");
        let b = vm.intern("some unique string");
        assert_eq!(a, b);

        // Unrooted: the interner entry is weak, so after collection a fresh
        // intern produces a fresh object.
        vm.collect_garbage();
        assert!(!vm.heap.is_live(a) || vm.intern("some unique string") == a);

        // Rooted: interning the same bytes returns the same handle across
        // collections.
        vm.push_str("another unique string");
        let c = vm.peek(0).as_obj();
        vm.collect_garbage();
        assert_eq!(c, vm.intern("another unique string"));
        vm.pop();
    }

    #[test]
    fn test_gc_triggers_on_threshold() {
        let mut vm = new_gc_stressed_vm();
        // Allocating churn with a threshold this low forces collections
        // constantly; the VM must stay coherent.
        for i in 0..50 {
            let s = vm.intern(&format!("churn-{}", i));
            vm.push(Value::Obj(s));
            vm.pop();
        }
        let live = vm.heap.live_count();
        vm.collect_garbage();
        assert!(vm.heap.live_count() <= live);
    }
}
