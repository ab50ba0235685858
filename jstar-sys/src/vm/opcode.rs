use crate::vm::operator::{BinaryOp, UnaryOp};

/// One instruction of the bytecode stream. Instructions are fixed-size enum
/// values rather than a packed byte stream; the on-disk format re-packs them
/// into compact tags (see `vm::serialize`).
///
/// Jump offsets are signed and relative to the IP *after* the instruction is
/// decoded, so `Jump(-1)` is a no-op.
#[derive(Eq, PartialEq, Debug, Clone, Copy)]
pub enum Opcode {

    /// Push constants `null`, `true` and `false`.
    Null,
    True,
    False,

    /// Pushes `consts[index]` of the executing function. Used for all
    /// number, string, function and native constants.
    Constant(u16),

    // Stack operations
    Pop,
    Dup,

    /// Locals are frame-relative stack slots. Slot 0 is the callee itself,
    /// parameters and locals occupy ascending slots above it.
    GetLocal(u8),
    SetLocal(u8),

    /// Globals live in the current module's globals table; the operand is a
    /// constant-pool index of the interned name. `SetGlobal` of an undefined
    /// name raises `NameException`.
    GetGlobal(u16),
    SetGlobal(u16),
    DefineGlobal(u16),

    /// Reads or writes through the executing closure's upvalue at `index`.
    GetUpvalue(u8),
    SetUpvalue(u8),

    /// Closes every open upvalue referencing the top stack slot, then pops it.
    CloseUpvalue,

    Unary(UnaryOp),
    Binary(BinaryOp),

    /// `a is B`: requires a Class on the right, walks the superclass chain
    /// of `class_of(a)`.
    Is,

    /// Takes a stack of `[.., operand, index]`. Lists, tuples and strings
    /// require an integer index and are range-checked; any other operand
    /// dispatches `__get__` on its class.
    GetIndex,

    /// Takes a stack of `[.., value, index, operand]`. The list fast path
    /// stores in place and leaves `value` on the stack; otherwise the value
    /// and operand slots are swapped and `__set__(index, value)` is invoked
    /// on the operand's class, leaving the method's return value.
    SetIndex,

    /// Field access; the operand is a constant-pool index of the interned
    /// name. On instances the field table wins over class methods; on
    /// modules the globals table wins over module-class methods. A method
    /// hit pops the receiver and pushes a fresh BoundMethod.
    GetField(u16),
    SetField(u16),

    Jump(i16),
    /// Pops the tested value.
    JumpIfFalse(i16),
    JumpIfTrue(i16),

    /// `for .. in` support. The loop keeps `[.., seq, iter]` on the stack
    /// (`iter` starts as `null`). `ForIter` copies both slots and invokes
    /// `__iter__(iter)` on `seq`, leaving the new iterator state on top.
    /// `ForNext` commits that state into the `iter` slot; while truthy it
    /// invokes `__next__(iter)` to produce the loop value, otherwise it
    /// jumps out by the offset.
    ForIter,
    ForNext(i16),

    /// Calls the value at `stack[top - argc]` with `argc` arguments above it.
    Call(u8),

    /// Invokes a method by name on `stack[top - argc]`; the first operand is
    /// a constant-pool index of the interned name.
    Invoke(u16, u8),

    /// `super.m(..)`: dispatches on the class stored in the executing
    /// function's constant-pool slot 0, placed there by `DefMethod`.
    Super(u16, u8),
    SuperBind(u16),

    /// Pops the return value, runs pending `ensure` handlers, closes the
    /// frame's upvalues, collapses the frame and pushes the value back.
    Return,

    // Object construction
    NewList,
    /// Appends the top of the stack to the list below it, popping the value.
    AppendList,
    /// Pops `n` values into a fresh tuple.
    NewTuple(u8),
    NewTable,

    /// Pushes a closure over the function at `consts[index]`, with no
    /// upvalues yet. Followed by one `CaptureLocal`/`CaptureUpvalue` per
    /// upvalue, in slot order.
    NewClosure(u16),
    /// Captures the local in frame slot `index` as a shared upvalue of the
    /// closure on top of the stack.
    CaptureLocal(u8),
    /// Copies upvalue `index` of the *enclosing* closure into the closure on
    /// top of the stack.
    CaptureUpvalue(u8),

    /// Pushes a new class named `consts[index]` with the root object class
    /// as superclass. Superclass methods are merged into the new class's
    /// method table at creation time.
    NewClass(u16),
    /// As `NewClass`, but pops the superclass off the stack first. Raises
    /// `TypeException` if it is not a class or is a built-in class.
    NewSubclass(u16),

    /// Takes `[.., class, closure]`; stores the class's superclass into the
    /// closure function's constant slot 0 (the `Super` convention), then
    /// defines the method.
    DefMethod(u16),
    /// Takes the class on top of the stack; resolves the native at
    /// `consts[native_index]` by (module, class, name) and defines it as a
    /// method. Operands: name index, native constant index.
    NatMethod(u16, u16),
    /// Resolves the free native function on top of the stack by
    /// (module, name).
    Native(u16),

    /// Pops a list or tuple and pushes its first `n` elements in order.
    /// Raises `TypeException` if fewer than `n` are present.
    Unpack(u8),

    // Imports; operands are constant-pool indices of interned names
    Import(u16),
    ImportAs(u16, u16),
    ImportFrom(u16),
    ImportName(u16, u16),

    /// Installs an exception (or ensure) handler on the current frame,
    /// recording the jump target and the stack height to restore.
    SetupExcept(i16),
    SetupEnsure(i16),
    /// Uninstalls the innermost handler on normal completion of a `try` body.
    PopHandler,

    /// Verifies the top of the stack is an `Exception` instance, attaches a
    /// fresh stack trace and begins unwinding.
    Raise,

    /// Join point after a `try` body and each handler. Consumes
    /// `[.., value, cause]`: a `null` cause (normal completion) falls
    /// through, `Except` resumes unwinding with the exception, `Return`
    /// re-enters the return path so outer `ensure` handlers still run.
    EndTry,
}


#[cfg(test)]
mod test {
    use crate::vm::opcode::Opcode;

    #[test] fn test_layout() { assert!(std::mem::size_of::<Opcode>() <= 8); }
}
