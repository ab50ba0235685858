use std::rc::Rc;

use fxhash::FxHashMap;

use crate::vm::opcode::Opcode;
use crate::vm::table::{Table, ValueMap};
use crate::vm::value::Value;
use crate::vm::{Raised, VirtualMachine};

/// Handle to a heap object: an index into the arena's slot vector. Handles
/// are stable for the lifetime of the object; slots are recycled through a
/// free list after the sweep phase.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug)]
pub struct ObjRef(u32);

impl ObjRef {
    pub fn index(self) -> usize {
        self.0 as usize
    }

    pub fn from_index(index: usize) -> ObjRef {
        ObjRef(index as u32)
    }
}

/// Host function with the same calling contract as a script function: its
/// arguments occupy the frame's stack window, it pushes exactly one return
/// value on success, and it fails by returning `Err` with an exception
/// already raised on the stack.
pub type NativeFn = fn(&mut VirtualMachine) -> Result<(), Raised>;

/// The immutable part of a compiled function, shared between the heap object
/// and the dispatch loop's cached frame registers.
#[derive(Debug)]
pub struct FunProto {
    pub name: String,
    pub arity: u8,
    pub vararg: bool,
    pub code: Vec<Opcode>,
    /// Source line per instruction, parallel to `code`.
    pub lines: Vec<u32>,
}

/// A compiled function. The constant pool is mutable: `DefMethod` stores the
/// defining class's superclass into slot 0 to implement `super` dispatch.
#[derive(Debug)]
pub struct FunData {
    pub proto: Rc<FunProto>,
    pub consts: Vec<Value>,
    pub defaults: Vec<Value>,
    pub module: ObjRef,
}

#[derive(Debug)]
pub struct ClosureData {
    pub fun: ObjRef,
    pub upvalues: Vec<ObjRef>,
}

#[derive(Debug)]
pub struct NativeData {
    pub name: String,
    pub module: ObjRef,
    pub arity: u8,
    pub vararg: bool,
    pub defaults: Vec<Value>,
    /// Resolved host function pointer; `None` until the `Native`/`NatMethod`
    /// opcode binds it from the registration table.
    pub fun: Option<NativeFn>,
}

#[derive(Debug)]
pub struct ClassData {
    pub name: String,
    pub superclass: Option<ObjRef>,
    /// Method table including entries eagerly copied from the superclass at
    /// class creation, so lookup never walks the inheritance chain.
    pub methods: Table,
}

#[derive(Debug)]
pub struct InstanceData {
    pub fields: Table,
}

#[derive(Copy, Clone, Debug)]
pub struct BoundData {
    pub receiver: Value,
    pub method: ObjRef,
}

#[derive(Debug)]
pub struct ModuleData {
    /// Interned module name, also the registry key.
    pub name: ObjRef,
    pub globals: Table,
}

/// A reference cell bridging a closure and a captured variable: open while
/// the variable still lives on the operand stack (holding its slot index),
/// closed once the scope exits (owning the value).
#[derive(Debug)]
pub enum UpvalueState {
    Open(usize),
    Closed(Value),
}

#[derive(Clone, Debug)]
pub struct TraceLine {
    pub line: Option<u32>,
    pub module: String,
    pub function: String,
}

#[derive(Debug)]
pub enum ObjKind {
    /// Immutable contents, shared with the interner's key so the bytes are
    /// stored once. Equality of interned strings is handle equality.
    Str(Rc<str>),
    List(Vec<Value>),
    Tuple(Box<[Value]>),
    Table(ValueMap),
    Fun(FunData),
    Closure(ClosureData),
    Native(NativeData),
    Class(ClassData),
    Instance(InstanceData),
    Bound(BoundData),
    Module(ModuleData),
    Upvalue(UpvalueState),
    StackTrace(Vec<TraceLine>),
}

/// Common object header: the class pointer plus the kind payload. The mark
/// bit lives in a side bitmap on the arena.
#[derive(Debug)]
pub struct Obj {
    pub class: ObjRef,
    pub kind: ObjKind,
}

/// The object arena. Allocation links objects into `slots`; destruction is
/// exclusively by the sweep phase, which returns slots to the free list.
pub struct Heap {
    slots: Vec<Option<Obj>>,
    marks: Vec<bool>,
    free: Vec<u32>,
    grey: Vec<ObjRef>,

    /// The string interner: content to handle. Entries are weak, removed
    /// before the sweep for any string the mark phase did not reach.
    pub(crate) strings: FxHashMap<Rc<str>, ObjRef>,

    pub(crate) allocated: usize,
    pub(crate) next_gc: usize,
    pub(crate) grow_rate: usize,

    /// Collect on every allocation, regardless of the threshold. Enabled by
    /// the `stress_gc` feature and by GC-pressure tests.
    pub(crate) stress: bool,
}

fn mark_child(marks: &mut [bool], grey: &mut Vec<ObjRef>, child: ObjRef) {
    if !marks[child.index()] {
        marks[child.index()] = true;
        grey.push(child);
    }
}

fn mark_value_child(marks: &mut [bool], grey: &mut Vec<ObjRef>, v: &Value) {
    if let Value::Obj(child) = v {
        mark_child(marks, grey, *child);
    }
}

/// Byte estimate for GC accounting. Collections are charged for their
/// element storage at allocation and release; growth in between is not
/// tracked, so `allocated` is an estimate rather than an exact figure.
fn obj_size(kind: &ObjKind) -> usize {
    use std::mem::size_of;
    let val = size_of::<Value>();
    let payload = match kind {
        ObjKind::Str(s) => s.len(),
        ObjKind::List(v) => v.capacity() * val,
        ObjKind::Tuple(v) => v.len() * val,
        ObjKind::Table(m) => m.len() * 2 * val,
        ObjKind::Fun(f) => (f.consts.len() + f.defaults.len()) * val + f.proto.code.len() * 8,
        ObjKind::Closure(c) => c.upvalues.len() * size_of::<ObjRef>(),
        ObjKind::Native(n) => n.defaults.len() * val,
        ObjKind::Class(c) => c.methods.len() * 2 * val,
        ObjKind::Instance(i) => i.fields.len() * 2 * val,
        ObjKind::Bound(_) => 0,
        ObjKind::Module(m) => m.globals.len() * 2 * val,
        ObjKind::Upvalue(_) => 0,
        ObjKind::StackTrace(t) => t.len() * size_of::<TraceLine>(),
    };
    size_of::<Obj>() + payload
}

impl Heap {
    pub fn new(init_gc: usize, grow_rate: usize) -> Heap {
        Heap {
            slots: Vec::new(),
            marks: Vec::new(),
            free: Vec::new(),
            grey: Vec::new(),
            strings: FxHashMap::default(),
            allocated: 0,
            next_gc: init_gc,
            grow_rate: grow_rate.max(2),
            stress: cfg!(feature = "stress_gc"),
        }
    }

    /// Allocates without checking the GC threshold. Use
    /// `VirtualMachine::alloc`, which collects first when due.
    pub fn raw_alloc(&mut self, class: ObjRef, kind: ObjKind) -> ObjRef {
        self.allocated += obj_size(&kind);
        let obj = Obj { class, kind };
        match self.free.pop() {
            Some(i) => {
                self.slots[i as usize] = Some(obj);
                self.marks[i as usize] = false;
                ObjRef(i)
            }
            None => {
                self.slots.push(Some(obj));
                self.marks.push(false);
                ObjRef((self.slots.len() - 1) as u32)
            }
        }
    }

    pub fn get(&self, r: ObjRef) -> &Obj {
        self.slots[r.index()].as_ref().expect("dangling object reference")
    }

    pub fn get_mut(&mut self, r: ObjRef) -> &mut Obj {
        self.slots[r.index()].as_mut().expect("dangling object reference")
    }

    pub fn class_of_obj(&self, r: ObjRef) -> ObjRef {
        self.get(r).class
    }

    pub fn set_class(&mut self, r: ObjRef, class: ObjRef) {
        self.get_mut(r).class = class;
    }

    /// Number of live objects, used by GC tests.
    pub fn live_count(&self) -> usize {
        self.slots.iter().filter(|s| s.is_some()).count()
    }

    pub fn is_live(&self, r: ObjRef) -> bool {
        self.slots.get(r.index()).map_or(false, |s| s.is_some())
    }

    // ===== Mark / trace / sweep ===== //

    pub fn mark_obj(&mut self, r: ObjRef) {
        if !self.marks[r.index()] {
            self.marks[r.index()] = true;
            self.grey.push(r);
        }
    }

    pub fn mark_value(&mut self, v: &Value) {
        if let Value::Obj(r) = v {
            self.mark_obj(*r);
        }
    }

    /// Drains the grey worklist, marking every object reachable from the
    /// already-marked set.
    pub fn trace_references(&mut self) {
        while let Some(r) = self.grey.pop() {
            let Heap { slots, marks, grey, .. } = self;
            let obj = slots[r.index()].as_ref().expect("grey object was freed");

            mark_child(marks, grey, obj.class);
            match &obj.kind {
                ObjKind::Str(_) | ObjKind::StackTrace(_) => {}
                ObjKind::List(values) => {
                    for v in values {
                        mark_value_child(marks, grey, v);
                    }
                }
                ObjKind::Tuple(values) => {
                    for v in values.iter() {
                        mark_value_child(marks, grey, v);
                    }
                }
                ObjKind::Table(map) => {
                    for (k, v) in map.iter() {
                        mark_value_child(marks, grey, &k);
                        mark_value_child(marks, grey, &v);
                    }
                }
                ObjKind::Fun(f) => {
                    for v in f.consts.iter().chain(f.defaults.iter()) {
                        mark_value_child(marks, grey, v);
                    }
                    mark_child(marks, grey, f.module);
                }
                ObjKind::Closure(c) => {
                    mark_child(marks, grey, c.fun);
                    for &uv in &c.upvalues {
                        mark_child(marks, grey, uv);
                    }
                }
                ObjKind::Native(n) => {
                    for v in &n.defaults {
                        mark_value_child(marks, grey, v);
                    }
                    mark_child(marks, grey, n.module);
                }
                ObjKind::Class(c) => {
                    if let Some(sup) = c.superclass {
                        mark_child(marks, grey, sup);
                    }
                    for (name, method) in c.methods.iter() {
                        mark_child(marks, grey, name);
                        mark_value_child(marks, grey, &method);
                    }
                }
                ObjKind::Instance(i) => {
                    for (name, value) in i.fields.iter() {
                        mark_child(marks, grey, name);
                        mark_value_child(marks, grey, &value);
                    }
                }
                ObjKind::Bound(b) => {
                    mark_value_child(marks, grey, &b.receiver);
                    mark_child(marks, grey, b.method);
                }
                ObjKind::Module(m) => {
                    mark_child(marks, grey, m.name);
                    for (name, value) in m.globals.iter() {
                        mark_child(marks, grey, name);
                        mark_value_child(marks, grey, &value);
                    }
                }
                ObjKind::Upvalue(UpvalueState::Closed(v)) => mark_value_child(marks, grey, v),
                ObjKind::Upvalue(UpvalueState::Open(_)) => {}
            }
        }
    }

    /// Drops interner entries whose strings the mark phase did not reach, so
    /// interned strings do not keep themselves alive.
    pub fn sweep_strings(&mut self) {
        let marks = &self.marks;
        self.strings.retain(|_, r| marks[r.index()]);
    }

    /// Frees every unmarked object and clears the mark bits of survivors.
    pub fn sweep(&mut self) {
        for i in 0..self.slots.len() {
            if self.slots[i].is_some() && !self.marks[i] {
                let obj = self.slots[i].take().unwrap();
                self.allocated = self.allocated.saturating_sub(obj_size(&obj.kind));
                self.free.push(i as u32);
            }
            self.marks[i] = false;
        }
    }

    // ===== Typed accessors ===== //
    //
    // These panic on a kind mismatch: opcode and embedding contracts
    // guarantee the kind, so a mismatch is interpreter corruption.

    pub fn as_str(&self, r: ObjRef) -> &str {
        match &self.get(r).kind {
            ObjKind::Str(s) => s,
            k => panic!("Not a string: {:?}", k),
        }
    }

    pub fn as_list(&self, r: ObjRef) -> &Vec<Value> {
        match &self.get(r).kind {
            ObjKind::List(v) => v,
            k => panic!("Not a list: {:?}", k),
        }
    }

    pub fn as_list_mut(&mut self, r: ObjRef) -> &mut Vec<Value> {
        match &mut self.get_mut(r).kind {
            ObjKind::List(v) => v,
            k => panic!("Not a list: {:?}", k),
        }
    }

    pub fn as_tuple(&self, r: ObjRef) -> &[Value] {
        match &self.get(r).kind {
            ObjKind::Tuple(v) => v,
            k => panic!("Not a tuple: {:?}", k),
        }
    }

    pub fn as_tuple_mut(&mut self, r: ObjRef) -> &mut Box<[Value]> {
        match &mut self.get_mut(r).kind {
            ObjKind::Tuple(v) => v,
            k => panic!("Not a tuple: {:?}", k),
        }
    }

    pub fn as_table(&self, r: ObjRef) -> &ValueMap {
        match &self.get(r).kind {
            ObjKind::Table(m) => m,
            k => panic!("Not a table: {:?}", k),
        }
    }

    pub fn as_table_mut(&mut self, r: ObjRef) -> &mut ValueMap {
        match &mut self.get_mut(r).kind {
            ObjKind::Table(m) => m,
            k => panic!("Not a table: {:?}", k),
        }
    }

    pub fn as_fun(&self, r: ObjRef) -> &FunData {
        match &self.get(r).kind {
            ObjKind::Fun(f) => f,
            k => panic!("Not a function: {:?}", k),
        }
    }

    pub fn as_fun_mut(&mut self, r: ObjRef) -> &mut FunData {
        match &mut self.get_mut(r).kind {
            ObjKind::Fun(f) => f,
            k => panic!("Not a function: {:?}", k),
        }
    }

    pub fn as_closure(&self, r: ObjRef) -> &ClosureData {
        match &self.get(r).kind {
            ObjKind::Closure(c) => c,
            k => panic!("Not a closure: {:?}", k),
        }
    }

    pub fn as_closure_mut(&mut self, r: ObjRef) -> &mut ClosureData {
        match &mut self.get_mut(r).kind {
            ObjKind::Closure(c) => c,
            k => panic!("Not a closure: {:?}", k),
        }
    }

    pub fn as_native(&self, r: ObjRef) -> &NativeData {
        match &self.get(r).kind {
            ObjKind::Native(n) => n,
            k => panic!("Not a native: {:?}", k),
        }
    }

    pub fn as_native_mut(&mut self, r: ObjRef) -> &mut NativeData {
        match &mut self.get_mut(r).kind {
            ObjKind::Native(n) => n,
            k => panic!("Not a native: {:?}", k),
        }
    }

    pub fn as_class(&self, r: ObjRef) -> &ClassData {
        match &self.get(r).kind {
            ObjKind::Class(c) => c,
            k => panic!("Not a class: {:?}", k),
        }
    }

    pub fn as_class_mut(&mut self, r: ObjRef) -> &mut ClassData {
        match &mut self.get_mut(r).kind {
            ObjKind::Class(c) => c,
            k => panic!("Not a class: {:?}", k),
        }
    }

    pub fn as_instance(&self, r: ObjRef) -> &InstanceData {
        match &self.get(r).kind {
            ObjKind::Instance(i) => i,
            k => panic!("Not an instance: {:?}", k),
        }
    }

    pub fn as_instance_mut(&mut self, r: ObjRef) -> &mut InstanceData {
        match &mut self.get_mut(r).kind {
            ObjKind::Instance(i) => i,
            k => panic!("Not an instance: {:?}", k),
        }
    }

    pub fn as_bound(&self, r: ObjRef) -> &BoundData {
        match &self.get(r).kind {
            ObjKind::Bound(b) => b,
            k => panic!("Not a bound method: {:?}", k),
        }
    }

    pub fn as_module(&self, r: ObjRef) -> &ModuleData {
        match &self.get(r).kind {
            ObjKind::Module(m) => m,
            k => panic!("Not a module: {:?}", k),
        }
    }

    pub fn as_module_mut(&mut self, r: ObjRef) -> &mut ModuleData {
        match &mut self.get_mut(r).kind {
            ObjKind::Module(m) => m,
            k => panic!("Not a module: {:?}", k),
        }
    }

    pub fn as_upvalue(&self, r: ObjRef) -> &UpvalueState {
        match &self.get(r).kind {
            ObjKind::Upvalue(u) => u,
            k => panic!("Not an upvalue: {:?}", k),
        }
    }

    pub fn as_upvalue_mut(&mut self, r: ObjRef) -> &mut UpvalueState {
        match &mut self.get_mut(r).kind {
            ObjKind::Upvalue(u) => u,
            k => panic!("Not an upvalue: {:?}", k),
        }
    }

    pub fn as_trace_mut(&mut self, r: ObjRef) -> &mut Vec<TraceLine> {
        match &mut self.get_mut(r).kind {
            ObjKind::StackTrace(t) => t,
            k => panic!("Not a stack trace: {:?}", k),
        }
    }

    pub fn as_trace(&self, r: ObjRef) -> &[TraceLine] {
        match &self.get(r).kind {
            ObjKind::StackTrace(t) => t,
            k => panic!("Not a stack trace: {:?}", k),
        }
    }

    pub fn is_str(&self, r: ObjRef) -> bool { matches!(self.get(r).kind, ObjKind::Str(_)) }
    pub fn is_list(&self, r: ObjRef) -> bool { matches!(self.get(r).kind, ObjKind::List(_)) }
    pub fn is_tuple(&self, r: ObjRef) -> bool { matches!(self.get(r).kind, ObjKind::Tuple(_)) }
    pub fn is_table(&self, r: ObjRef) -> bool { matches!(self.get(r).kind, ObjKind::Table(_)) }
    pub fn is_fun(&self, r: ObjRef) -> bool { matches!(self.get(r).kind, ObjKind::Fun(_)) }
    pub fn is_closure(&self, r: ObjRef) -> bool { matches!(self.get(r).kind, ObjKind::Closure(_)) }
    pub fn is_native(&self, r: ObjRef) -> bool { matches!(self.get(r).kind, ObjKind::Native(_)) }
    pub fn is_class(&self, r: ObjRef) -> bool { matches!(self.get(r).kind, ObjKind::Class(_)) }
    pub fn is_instance(&self, r: ObjRef) -> bool { matches!(self.get(r).kind, ObjKind::Instance(_)) }
    pub fn is_module(&self, r: ObjRef) -> bool { matches!(self.get(r).kind, ObjKind::Module(_)) }
}
