//! Built-in class bootstrap and the core native methods the runtime itself
//! depends on. Everything richer (string utilities, table API, math, io)
//! belongs to the external standard library and is bound through the same
//! native-registration mechanism at module load time.

use crate::util::is_int;
use crate::vm::heap::{ClassData, ModuleData, NativeData, NativeFn, ObjKind, ObjRef};
use crate::vm::table::Table;
use crate::vm::value::Value;
use crate::vm::{Raised, Stack, VirtualMachine};

/// Method names the runtime needs at dispatch time, interned once at VM
/// creation and cached by index.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum Sym {
    Ctor,
    Iter,
    Next,
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    Radd,
    Rsub,
    Rmul,
    Rdiv,
    Rmod,
    Get,
    Set,
    Eq,
    Lt,
    Le,
    Gt,
    Ge,
    Neg,
    Msg,
    Stacktrace,
}

impl Sym {
    pub const ALL: [Sym; 23] = [
        Sym::Ctor,
        Sym::Iter,
        Sym::Next,
        Sym::Add,
        Sym::Sub,
        Sym::Mul,
        Sym::Div,
        Sym::Mod,
        Sym::Radd,
        Sym::Rsub,
        Sym::Rmul,
        Sym::Rdiv,
        Sym::Rmod,
        Sym::Get,
        Sym::Set,
        Sym::Eq,
        Sym::Lt,
        Sym::Le,
        Sym::Gt,
        Sym::Ge,
        Sym::Neg,
        Sym::Msg,
        Sym::Stacktrace,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Sym::Ctor => "new",
            Sym::Iter => "__iter__",
            Sym::Next => "__next__",
            Sym::Add => "__add__",
            Sym::Sub => "__sub__",
            Sym::Mul => "__mul__",
            Sym::Div => "__div__",
            Sym::Mod => "__mod__",
            Sym::Radd => "__radd__",
            Sym::Rsub => "__rsub__",
            Sym::Rmul => "__rmul__",
            Sym::Rdiv => "__rdiv__",
            Sym::Rmod => "__rmod__",
            Sym::Get => "__get__",
            Sym::Set => "__set__",
            Sym::Eq => "__eq__",
            Sym::Lt => "__lt__",
            Sym::Le => "__le__",
            Sym::Gt => "__gt__",
            Sym::Ge => "__ge__",
            Sym::Neg => "__neg__",
            Sym::Msg => "_msg",
            Sym::Stacktrace => "_stacktrace",
        }
    }
}

/// Handles of the built-in classes, filled in during bootstrap. The
/// `Exception` class is a regular, subclassable class; the rest split into
/// instantiable (list, tuple, number, bool, string) and non-instantiable
/// built-ins.
pub struct Builtins {
    pub object: ObjRef,
    pub class: ObjRef,
    pub null: ObjRef,
    pub boolean: ObjRef,
    pub number: ObjRef,
    pub string: ObjRef,
    pub function: ObjRef,
    pub module: ObjRef,
    pub list: ObjRef,
    pub tuple: ObjRef,
    pub table: ObjRef,
    pub stack_trace: ObjRef,
    pub exception: ObjRef,
}

impl Builtins {
    pub(crate) fn placeholder() -> Builtins {
        let zero = ObjRef::from_index(0);
        Builtins {
            object: zero,
            class: zero,
            null: zero,
            boolean: zero,
            number: zero,
            string: zero,
            function: zero,
            module: zero,
            list: zero,
            tuple: zero,
            table: zero,
            stack_trace: zero,
            exception: zero,
        }
    }

    pub(crate) fn all(&self) -> [ObjRef; 13] {
        [
            self.object,
            self.class,
            self.null,
            self.boolean,
            self.number,
            self.string,
            self.function,
            self.module,
            self.list,
            self.tuple,
            self.table,
            self.stack_trace,
            self.exception,
        ]
    }
}

fn define_method(
    vm: &mut VirtualMachine,
    cls: ObjRef,
    name: &str,
    arity: u8,
    defaults: Vec<Value>,
    fun: NativeFn,
) {
    let name_ref = vm.intern(name);
    let core = vm.core_module;
    let native = vm.alloc(
        vm.builtins.function,
        ObjKind::Native(NativeData {
            name: name.into(),
            module: core,
            arity,
            vararg: false,
            defaults,
            fun: Some(fun),
        }),
    );
    vm.heap.as_class_mut(cls).methods.put(name_ref, Value::Obj(native));
}

/// Creates the built-in classes, the core module and the core natives.
/// Runs with collection suppressed: nothing allocated here is rooted yet.
pub(crate) fn bootstrap(vm: &mut VirtualMachine) {
    // The class of classes points to itself; its superclass is patched to
    // Object right after Object exists.
    let class_cls = vm.heap.raw_alloc(
        ObjRef::from_index(0),
        ObjKind::Class(ClassData { name: "Class".into(), superclass: None, methods: Table::new() }),
    );
    vm.heap.set_class(class_cls, class_cls);

    let object = vm.heap.raw_alloc(
        class_cls,
        ObjKind::Class(ClassData { name: "Object".into(), superclass: None, methods: Table::new() }),
    );
    vm.heap.as_class_mut(class_cls).superclass = Some(object);

    let new_class = |vm: &mut VirtualMachine, name: &str| {
        vm.heap.raw_alloc(
            class_cls,
            ObjKind::Class(ClassData {
                name: name.into(),
                superclass: Some(object),
                methods: Table::new(),
            }),
        )
    };

    let null = new_class(vm, "Null");
    let boolean = new_class(vm, "Boolean");
    let number = new_class(vm, "Number");
    let string = new_class(vm, "String");
    let function = new_class(vm, "Function");
    let module_cls = new_class(vm, "Module");
    let list = new_class(vm, "List");
    let tuple = new_class(vm, "Tuple");
    let table = new_class(vm, "Table");
    let stack_trace = new_class(vm, "StackTrace");
    let exception = new_class(vm, "Exception");

    vm.builtins = Builtins {
        object,
        class: class_cls,
        null,
        boolean,
        number,
        string,
        function,
        module: module_cls,
        list,
        tuple,
        table,
        stack_trace,
        exception,
    };

    // Interning works from here on: the string class exists.
    let mut syms = Vec::with_capacity(Sym::ALL.len());
    for s in Sym::ALL {
        syms.push(vm.intern(s.name()));
    }
    vm.set_syms(syms);

    let core_name = vm.intern("__core__");
    let core = vm.heap.raw_alloc(
        vm.builtins.module,
        ObjKind::Module(ModuleData { name: core_name, globals: Table::new() }),
    );
    vm.core_module = core;
    vm.main_module = core;
    vm.module = core;
    vm.modules.insert(core_name, core);

    // Object protocol defaults, inherited by everything through the eager
    // method-table merge.
    define_method(vm, object, "__eq__", 1, vec![], obj_eq);
    define_method(vm, object, "__string__", 0, vec![], value_string);

    let object_methods = vm.heap.as_class(object).methods.clone();
    for cls in [
        class_cls, null, boolean, number, string, function, module_cls, list, tuple, table,
        stack_trace, exception,
    ] {
        vm.heap.as_class_mut(cls).methods.merge_from(&object_methods);
    }

    // Collection protocols.
    define_method(vm, list, "append", 1, vec![], list_append);
    define_method(vm, list, "__get__", 1, vec![], list_get);
    define_method(vm, list, "__set__", 2, vec![], list_set);
    define_method(vm, list, "__iter__", 1, vec![], list_iter);
    define_method(vm, list, "__next__", 1, vec![], list_next);

    define_method(vm, tuple, "__get__", 1, vec![], tuple_get);
    define_method(vm, tuple, "__iter__", 1, vec![], tuple_iter);
    define_method(vm, tuple, "__next__", 1, vec![], tuple_next);

    define_method(vm, string, "__iter__", 1, vec![], str_iter);
    define_method(vm, string, "__next__", 1, vec![], str_next);

    define_method(vm, table, "__get__", 1, vec![], table_get);
    define_method(vm, table, "__set__", 2, vec![], table_set);

    // The exception hierarchy.
    let empty = vm.intern("");
    define_method(vm, exception, "new", 1, vec![Value::Obj(empty)], exc_new);
    define_method(vm, exception, "message", 0, vec![], exc_message);

    let classes: &[(&str, ObjRef)] = &[
        ("Object", object),
        ("Class", class_cls),
        ("Null", null),
        ("Boolean", boolean),
        ("Number", number),
        ("String", string),
        ("Function", function),
        ("Module", module_cls),
        ("List", list),
        ("Tuple", tuple),
        ("Table", table),
        ("StackTrace", stack_trace),
        ("Exception", exception),
    ];
    for (name, cls) in classes {
        let n = vm.intern(name);
        let c = vm.core_module;
        vm.heap.as_module_mut(c).globals.put(n, Value::Obj(*cls));
    }

    for name in [
        "TypeException",
        "NameException",
        "FieldException",
        "MethodException",
        "ImportException",
        "StackOverflowException",
    ] {
        let methods = vm.heap.as_class(exception).methods.clone();
        let cls = vm.heap.raw_alloc(
            class_cls,
            ObjKind::Class(ClassData { name: name.into(), superclass: Some(exception), methods }),
        );
        let n = vm.intern(name);
        let c = vm.core_module;
        vm.heap.as_module_mut(c).globals.put(n, Value::Obj(cls));
    }

    // The main module, seeded with the core names.
    let main_name = vm.intern("__main__");
    let main = vm.new_module(main_name);
    vm.main_module = main;
    vm.module = main;
}

// ===== Core natives ===== //
//
// Natives see their receiver in slot 0 and arguments in ascending slots, and
// push exactly one return value on success.

fn obj_eq(vm: &mut VirtualMachine) -> Result<(), Raised> {
    let a = vm.get_slot(0);
    let b = vm.get_slot(1);
    vm.push(Value::Bool(a.equals(&b)));
    Ok(())
}

fn value_string(vm: &mut VirtualMachine) -> Result<(), Raised> {
    let v = vm.get_slot(0);
    let s = vm.to_display(v);
    let r = vm.intern(&s);
    vm.push(Value::Obj(r));
    Ok(())
}

fn list_append(vm: &mut VirtualMachine) -> Result<(), Raised> {
    let l = vm.get_slot(0).as_obj();
    let v = vm.get_slot(1);
    vm.heap.as_list_mut(l).push(v);
    let receiver = vm.get_slot(0);
    vm.push(receiver);
    Ok(())
}

fn list_get(vm: &mut VirtualMachine) -> Result<(), Raised> {
    let l = vm.get_slot(0).as_obj();
    let len = vm.heap.as_list(l).len();
    let idx = vm.get_slot(1);
    let i = vm.check_index(idx, len, "List")?;
    let v = vm.heap.as_list(l)[i];
    vm.push(v);
    Ok(())
}

fn list_set(vm: &mut VirtualMachine) -> Result<(), Raised> {
    let l = vm.get_slot(0).as_obj();
    let len = vm.heap.as_list(l).len();
    let idx = vm.get_slot(1);
    let v = vm.get_slot(2);
    let i = vm.check_index(idx, len, "List")?;
    vm.heap.as_list_mut(l)[i] = v;
    vm.push(v);
    Ok(())
}

/// Shared `__iter__` protocol over integer-indexed sequences: `null` starts
/// at slot 0, a previous index advances by one, and a falsy result ends the
/// loop.
fn seq_iter(vm: &mut VirtualMachine, len: usize) -> Result<(), Raised> {
    let prev = vm.get_slot(1);
    let next = match prev {
        Value::Null => {
            if len > 0 {
                Value::Num(0.0)
            } else {
                Value::Bool(false)
            }
        }
        Value::Num(n) if is_int(n) => {
            if ((n + 1.0) as usize) < len {
                Value::Num(n + 1.0)
            } else {
                Value::Bool(false)
            }
        }
        _ => return Err(vm.raise("TypeException", "Invalid iterator state.")),
    };
    vm.push(next);
    Ok(())
}

fn seq_state(vm: &mut VirtualMachine, len: usize) -> Result<usize, Raised> {
    match vm.get_slot(1) {
        Value::Num(n) if is_int(n) && n >= 0.0 && (n as usize) < len => Ok(n as usize),
        _ => Err(vm.raise("TypeException", "Invalid iterator state.")),
    }
}

fn list_iter(vm: &mut VirtualMachine) -> Result<(), Raised> {
    let len = vm.heap.as_list(vm.get_slot(0).as_obj()).len();
    seq_iter(vm, len)
}

fn list_next(vm: &mut VirtualMachine) -> Result<(), Raised> {
    let l = vm.get_slot(0).as_obj();
    let len = vm.heap.as_list(l).len();
    let i = seq_state(vm, len)?;
    let v = vm.heap.as_list(l)[i];
    vm.push(v);
    Ok(())
}

fn tuple_get(vm: &mut VirtualMachine) -> Result<(), Raised> {
    let t = vm.get_slot(0).as_obj();
    let len = vm.heap.as_tuple(t).len();
    let idx = vm.get_slot(1);
    let i = vm.check_index(idx, len, "Tuple")?;
    let v = vm.heap.as_tuple(t)[i];
    vm.push(v);
    Ok(())
}

fn tuple_iter(vm: &mut VirtualMachine) -> Result<(), Raised> {
    let len = vm.heap.as_tuple(vm.get_slot(0).as_obj()).len();
    seq_iter(vm, len)
}

fn tuple_next(vm: &mut VirtualMachine) -> Result<(), Raised> {
    let t = vm.get_slot(0).as_obj();
    let len = vm.heap.as_tuple(t).len();
    let i = seq_state(vm, len)?;
    let v = vm.heap.as_tuple(t)[i];
    vm.push(v);
    Ok(())
}

fn str_iter(vm: &mut VirtualMachine) -> Result<(), Raised> {
    let len = vm.heap.as_str(vm.get_slot(0).as_obj()).chars().count();
    seq_iter(vm, len)
}

fn str_next(vm: &mut VirtualMachine) -> Result<(), Raised> {
    let s = vm.get_slot(0).as_obj();
    let len = vm.heap.as_str(s).chars().count();
    let i = seq_state(vm, len)?;
    let c = vm.heap.as_str(s).chars().nth(i).unwrap().to_string();
    let r = vm.intern(&c);
    vm.push(Value::Obj(r));
    Ok(())
}

fn hashable(vm: &VirtualMachine, v: Value) -> bool {
    match v {
        Value::Null | Value::Bool(_) | Value::Num(_) | Value::Handle(_) => true,
        Value::Obj(r) => vm.heap.is_str(r),
        Value::Cause(_) => false,
    }
}

fn table_get(vm: &mut VirtualMachine) -> Result<(), Raised> {
    let t = vm.get_slot(0).as_obj();
    let key = vm.get_slot(1);
    let v = vm.heap.as_table(t).get(key).unwrap_or(Value::Null);
    vm.push(v);
    Ok(())
}

fn table_set(vm: &mut VirtualMachine) -> Result<(), Raised> {
    let t = vm.get_slot(0).as_obj();
    let key = vm.get_slot(1);
    let v = vm.get_slot(2);
    if !hashable(vm, key) {
        let name = vm.type_name(key);
        return Err(vm.raise("TypeException", &format!("unhashable type {}", name)));
    }
    vm.heap.as_table_mut(t).put(key, v);
    vm.push(v);
    Ok(())
}

fn exc_new(vm: &mut VirtualMachine) -> Result<(), Raised> {
    let receiver = vm.get_slot(0).as_obj();
    let msg = vm.get_slot(1);
    let key = vm.sym(Sym::Msg);
    vm.heap.as_instance_mut(receiver).fields.put(key, msg);
    let receiver = vm.get_slot(0);
    vm.push(receiver);
    Ok(())
}

fn exc_message(vm: &mut VirtualMachine) -> Result<(), Raised> {
    let receiver = vm.get_slot(0).as_obj();
    let key = vm.sym(Sym::Msg);
    match vm.heap.as_instance(receiver).fields.get(key) {
        Some(m) => vm.push(m),
        None => {
            let empty = vm.intern("");
            vm.push(Value::Obj(empty));
        }
    }
    Ok(())
}
