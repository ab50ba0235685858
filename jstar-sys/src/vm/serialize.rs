//! The on-disk bytecode format: a versioned little-endian header followed by
//! the serialized top-level function, with nested function constants written
//! recursively. Instructions re-pack into compact tags; calls, invokes and
//! super-invokes with up to 10 arguments get dedicated one-byte forms.
//!
//! The format round-trips: loading a serialized function and executing it is
//! indistinguishable from executing the function it was written from.

use std::fmt;
use std::rc::Rc;

use crate::vm::heap::{FunData, FunProto, NativeData, ObjKind, ObjRef};
use crate::vm::opcode::Opcode;
use crate::vm::operator::{BinaryOp, UnaryOp};
use crate::vm::value::Value;
use crate::vm::{Stack, VirtualMachine};

pub const MAGIC: [u8; 4] = [0xA5, b'J', b'S', b'B'];
pub const VERSION: u16 = 1;

/// Constant-pool entry tags.
const TAG_NULL: u8 = 0;
const TAG_TRUE: u8 = 1;
const TAG_FALSE: u8 = 2;
const TAG_NUM: u8 = 3;
const TAG_STR: u8 = 4;
const TAG_FUN: u8 = 5;
const TAG_NATIVE: u8 = 6;

const BIN_OPS: [BinaryOp; 11] = [
    BinaryOp::Add,
    BinaryOp::Sub,
    BinaryOp::Mul,
    BinaryOp::Div,
    BinaryOp::Mod,
    BinaryOp::Pow,
    BinaryOp::LessThan,
    BinaryOp::LessThanEqual,
    BinaryOp::GreaterThan,
    BinaryOp::GreaterThanEqual,
    BinaryOp::Equal,
];

#[derive(Debug, Eq, PartialEq)]
pub enum SerializeError {
    /// A constant that only exists at runtime (a patched superclass slot)
    /// cannot be written out.
    Unserializable(&'static str),
}

impl fmt::Display for SerializeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SerializeError::Unserializable(what) => {
                write!(f, "unserializable constant: {}", what)
            }
        }
    }
}

#[derive(Debug, Eq, PartialEq)]
pub enum DeserializeError {
    Truncated,
    BadMagic,
    BadVersion(u16),
    BadTag(u8),
    BadString,
}

impl fmt::Display for DeserializeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeserializeError::Truncated => write!(f, "unexpected end of bytecode file"),
            DeserializeError::BadMagic => write!(f, "not a bytecode file"),
            DeserializeError::BadVersion(v) => write!(f, "unsupported bytecode version {}", v),
            DeserializeError::BadTag(t) => write!(f, "unknown tag {}", t),
            DeserializeError::BadString => write!(f, "malformed string data"),
        }
    }
}

// ===== Writing ===== //

pub fn serialize_function(vm: &VirtualMachine, fun: ObjRef) -> Result<Vec<u8>, SerializeError> {
    let mut out = Vec::new();
    out.extend_from_slice(&MAGIC);
    out.extend_from_slice(&VERSION.to_le_bytes());
    write_function(vm, fun, &mut out)?;
    Ok(out)
}

fn write_str(s: &str, out: &mut Vec<u8>) {
    out.extend_from_slice(&(s.len() as u32).to_le_bytes());
    out.extend_from_slice(s.as_bytes());
}

fn write_function(vm: &VirtualMachine, fun: ObjRef, out: &mut Vec<u8>) -> Result<(), SerializeError> {
    let f = vm.heap.as_fun(fun);
    write_str(&f.proto.name, out);
    out.push(f.proto.arity);
    out.push(f.proto.vararg as u8);

    out.push(f.defaults.len() as u8);
    for &d in &f.defaults {
        write_const(vm, d, out)?;
    }

    out.extend_from_slice(&(f.proto.code.len() as u32).to_le_bytes());
    for &op in &f.proto.code {
        write_op(op, out);
    }
    for &line in &f.proto.lines {
        out.extend_from_slice(&line.to_le_bytes());
    }

    out.extend_from_slice(&(f.consts.len() as u16).to_le_bytes());
    for &c in &f.consts {
        write_const(vm, c, out)?;
    }
    Ok(())
}

fn write_const(vm: &VirtualMachine, v: Value, out: &mut Vec<u8>) -> Result<(), SerializeError> {
    match v {
        Value::Null => out.push(TAG_NULL),
        Value::Bool(true) => out.push(TAG_TRUE),
        Value::Bool(false) => out.push(TAG_FALSE),
        Value::Num(n) => {
            out.push(TAG_NUM);
            out.extend_from_slice(&n.to_le_bytes());
        }
        Value::Obj(r) => match &vm.heap.get(r).kind {
            ObjKind::Str(s) => {
                out.push(TAG_STR);
                write_str(s, out);
            }
            ObjKind::Fun(_) => {
                out.push(TAG_FUN);
                write_function(vm, r, out)?;
            }
            ObjKind::Native(n) => {
                out.push(TAG_NATIVE);
                write_str(&n.name, out);
                out.push(n.arity);
                out.push(n.vararg as u8);
                out.push(n.defaults.len() as u8);
                for &d in &n.defaults {
                    write_const(vm, d, out)?;
                }
            }
            _ => return Err(SerializeError::Unserializable("runtime object in constant pool")),
        },
        Value::Handle(_) => return Err(SerializeError::Unserializable("host handle")),
        Value::Cause(_) => return Err(SerializeError::Unserializable("cause marker")),
    }
    Ok(())
}

fn write_u16(n: u16, out: &mut Vec<u8>) {
    out.extend_from_slice(&n.to_le_bytes());
}

fn write_i16(n: i16, out: &mut Vec<u8>) {
    out.extend_from_slice(&n.to_le_bytes());
}

fn write_op(op: Opcode, out: &mut Vec<u8>) {
    match op {
        Opcode::Null => out.push(0),
        Opcode::True => out.push(1),
        Opcode::False => out.push(2),
        Opcode::Constant(i) => {
            out.push(3);
            write_u16(i, out);
        }
        Opcode::Pop => out.push(4),
        Opcode::Dup => out.push(5),
        Opcode::GetLocal(i) => {
            out.push(6);
            out.push(i);
        }
        Opcode::SetLocal(i) => {
            out.push(7);
            out.push(i);
        }
        Opcode::GetGlobal(i) => {
            out.push(8);
            write_u16(i, out);
        }
        Opcode::SetGlobal(i) => {
            out.push(9);
            write_u16(i, out);
        }
        Opcode::DefineGlobal(i) => {
            out.push(10);
            write_u16(i, out);
        }
        Opcode::GetUpvalue(i) => {
            out.push(11);
            out.push(i);
        }
        Opcode::SetUpvalue(i) => {
            out.push(12);
            out.push(i);
        }
        Opcode::CloseUpvalue => out.push(13),
        Opcode::Unary(UnaryOp::Neg) => out.push(14),
        Opcode::Unary(UnaryOp::Not) => out.push(15),
        Opcode::Binary(b) => {
            let idx = BIN_OPS.iter().position(|o| *o == b).unwrap() as u8;
            out.push(16 + idx);
        }
        Opcode::Is => out.push(27),
        Opcode::GetIndex => out.push(28),
        Opcode::SetIndex => out.push(29),
        Opcode::GetField(i) => {
            out.push(30);
            write_u16(i, out);
        }
        Opcode::SetField(i) => {
            out.push(31);
            write_u16(i, out);
        }
        Opcode::Jump(o) => {
            out.push(32);
            write_i16(o, out);
        }
        Opcode::JumpIfFalse(o) => {
            out.push(33);
            write_i16(o, out);
        }
        Opcode::JumpIfTrue(o) => {
            out.push(34);
            write_i16(o, out);
        }
        Opcode::ForIter => out.push(35),
        Opcode::ForNext(o) => {
            out.push(36);
            write_i16(o, out);
        }
        Opcode::Call(argc) => {
            if argc <= 10 {
                out.push(37 + argc);
            } else {
                out.push(48);
                out.push(argc);
            }
        }
        Opcode::Invoke(name, argc) => {
            if argc <= 10 {
                out.push(49 + argc);
                write_u16(name, out);
            } else {
                out.push(60);
                write_u16(name, out);
                out.push(argc);
            }
        }
        Opcode::Super(name, argc) => {
            if argc <= 10 {
                out.push(61 + argc);
                write_u16(name, out);
            } else {
                out.push(72);
                write_u16(name, out);
                out.push(argc);
            }
        }
        Opcode::SuperBind(name) => {
            out.push(73);
            write_u16(name, out);
        }
        Opcode::Return => out.push(74),
        Opcode::NewList => out.push(75),
        Opcode::AppendList => out.push(76),
        Opcode::NewTuple(n) => {
            out.push(77);
            out.push(n);
        }
        Opcode::NewTable => out.push(78),
        Opcode::NewClosure(i) => {
            out.push(79);
            write_u16(i, out);
        }
        Opcode::CaptureLocal(i) => {
            out.push(80);
            out.push(i);
        }
        Opcode::CaptureUpvalue(i) => {
            out.push(81);
            out.push(i);
        }
        Opcode::NewClass(i) => {
            out.push(82);
            write_u16(i, out);
        }
        Opcode::NewSubclass(i) => {
            out.push(83);
            write_u16(i, out);
        }
        Opcode::DefMethod(i) => {
            out.push(84);
            write_u16(i, out);
        }
        Opcode::NatMethod(name, nat) => {
            out.push(85);
            write_u16(name, out);
            write_u16(nat, out);
        }
        Opcode::Native(i) => {
            out.push(86);
            write_u16(i, out);
        }
        Opcode::Unpack(n) => {
            out.push(87);
            out.push(n);
        }
        Opcode::Import(i) => {
            out.push(88);
            write_u16(i, out);
        }
        Opcode::ImportAs(i, a) => {
            out.push(89);
            write_u16(i, out);
            write_u16(a, out);
        }
        Opcode::ImportFrom(i) => {
            out.push(90);
            write_u16(i, out);
        }
        Opcode::ImportName(m, n) => {
            out.push(91);
            write_u16(m, out);
            write_u16(n, out);
        }
        Opcode::SetupExcept(o) => {
            out.push(92);
            write_i16(o, out);
        }
        Opcode::SetupEnsure(o) => {
            out.push(93);
            write_i16(o, out);
        }
        Opcode::PopHandler => out.push(94),
        Opcode::Raise => out.push(95),
        Opcode::EndTry => out.push(96),
    }
}

// ===== Reading ===== //

struct Reader<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(bytes: &'a [u8]) -> Reader<'a> {
        Reader { bytes, pos: 0 }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], DeserializeError> {
        if self.pos + n > self.bytes.len() {
            return Err(DeserializeError::Truncated);
        }
        let slice = &self.bytes[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    fn u8(&mut self) -> Result<u8, DeserializeError> {
        Ok(self.take(1)?[0])
    }

    fn u16(&mut self) -> Result<u16, DeserializeError> {
        Ok(u16::from_le_bytes(self.take(2)?.try_into().unwrap()))
    }

    fn i16(&mut self) -> Result<i16, DeserializeError> {
        Ok(i16::from_le_bytes(self.take(2)?.try_into().unwrap()))
    }

    fn u32(&mut self) -> Result<u32, DeserializeError> {
        Ok(u32::from_le_bytes(self.take(4)?.try_into().unwrap()))
    }

    fn f64(&mut self) -> Result<f64, DeserializeError> {
        Ok(f64::from_le_bytes(self.take(8)?.try_into().unwrap()))
    }

    fn str(&mut self) -> Result<String, DeserializeError> {
        let len = self.u32()? as usize;
        let bytes = self.take(len)?;
        String::from_utf8(bytes.to_vec()).map_err(|_| DeserializeError::BadString)
    }
}

/// Loads a serialized top-level function into `module`, leaving it on the
/// stack (the same contract a compile has).
pub fn deserialize_function(
    vm: &mut VirtualMachine,
    bytes: &[u8],
    module: ObjRef,
) -> Result<ObjRef, DeserializeError> {
    let mark = vm.temp_roots.len();
    let mut r = Reader::new(bytes);

    if r.take(4)? != MAGIC {
        return Err(DeserializeError::BadMagic);
    }
    let version = r.u16()?;
    if version != VERSION {
        return Err(DeserializeError::BadVersion(version));
    }

    let result = read_function(vm, &mut r, module);
    match result {
        Ok(f) => {
            vm.push(Value::Obj(f));
            vm.temp_roots.truncate(mark);
            Ok(f)
        }
        Err(e) => {
            vm.temp_roots.truncate(mark);
            Err(e)
        }
    }
}

fn read_function(
    vm: &mut VirtualMachine,
    r: &mut Reader<'_>,
    module: ObjRef,
) -> Result<ObjRef, DeserializeError> {
    let name = r.str()?;
    let arity = r.u8()?;
    let vararg = r.u8()? != 0;

    let defaultc = r.u8()? as usize;
    let mut defaults = Vec::with_capacity(defaultc);
    for _ in 0..defaultc {
        defaults.push(read_const(vm, r, module)?);
    }

    let code_len = r.u32()? as usize;
    let mut code = Vec::with_capacity(code_len);
    for _ in 0..code_len {
        code.push(read_op(r)?);
    }
    let mut lines = Vec::with_capacity(code_len);
    for _ in 0..code_len {
        lines.push(r.u32()?);
    }

    let constc = r.u16()? as usize;
    let mut consts = Vec::with_capacity(constc);
    for _ in 0..constc {
        consts.push(read_const(vm, r, module)?);
    }

    let proto = Rc::new(FunProto { name, arity, vararg, code, lines });
    let f = vm.alloc(vm.builtins.function, ObjKind::Fun(FunData { proto, consts, defaults, module }));
    vm.temp_roots.push(f);
    Ok(f)
}

fn read_const(
    vm: &mut VirtualMachine,
    r: &mut Reader<'_>,
    module: ObjRef,
) -> Result<Value, DeserializeError> {
    let tag = r.u8()?;
    Ok(match tag {
        TAG_NULL => Value::Null,
        TAG_TRUE => Value::Bool(true),
        TAG_FALSE => Value::Bool(false),
        TAG_NUM => Value::Num(r.f64()?),
        TAG_STR => {
            let s = r.str()?;
            let interned = vm.intern(&s);
            vm.temp_roots.push(interned);
            Value::Obj(interned)
        }
        TAG_FUN => Value::Obj(read_function(vm, r, module)?),
        TAG_NATIVE => {
            let name = r.str()?;
            let arity = r.u8()?;
            let vararg = r.u8()? != 0;
            let defaultc = r.u8()? as usize;
            let mut defaults = Vec::with_capacity(defaultc);
            for _ in 0..defaultc {
                defaults.push(read_const(vm, r, module)?);
            }
            let n = vm.alloc(
                vm.builtins.function,
                ObjKind::Native(NativeData { name, module, arity, vararg, defaults, fun: None }),
            );
            vm.temp_roots.push(n);
            Value::Obj(n)
        }
        t => return Err(DeserializeError::BadTag(t)),
    })
}

fn read_op(r: &mut Reader<'_>) -> Result<Opcode, DeserializeError> {
    let tag = r.u8()?;
    Ok(match tag {
        0 => Opcode::Null,
        1 => Opcode::True,
        2 => Opcode::False,
        3 => Opcode::Constant(r.u16()?),
        4 => Opcode::Pop,
        5 => Opcode::Dup,
        6 => Opcode::GetLocal(r.u8()?),
        7 => Opcode::SetLocal(r.u8()?),
        8 => Opcode::GetGlobal(r.u16()?),
        9 => Opcode::SetGlobal(r.u16()?),
        10 => Opcode::DefineGlobal(r.u16()?),
        11 => Opcode::GetUpvalue(r.u8()?),
        12 => Opcode::SetUpvalue(r.u8()?),
        13 => Opcode::CloseUpvalue,
        14 => Opcode::Unary(UnaryOp::Neg),
        15 => Opcode::Unary(UnaryOp::Not),
        16..=26 => Opcode::Binary(BIN_OPS[(tag - 16) as usize]),
        27 => Opcode::Is,
        28 => Opcode::GetIndex,
        29 => Opcode::SetIndex,
        30 => Opcode::GetField(r.u16()?),
        31 => Opcode::SetField(r.u16()?),
        32 => Opcode::Jump(r.i16()?),
        33 => Opcode::JumpIfFalse(r.i16()?),
        34 => Opcode::JumpIfTrue(r.i16()?),
        35 => Opcode::ForIter,
        36 => Opcode::ForNext(r.i16()?),
        37..=47 => Opcode::Call(tag - 37),
        48 => Opcode::Call(r.u8()?),
        49..=59 => Opcode::Invoke(r.u16()?, tag - 49),
        60 => {
            let name = r.u16()?;
            let argc = r.u8()?;
            Opcode::Invoke(name, argc)
        }
        61..=71 => Opcode::Super(r.u16()?, tag - 61),
        72 => {
            let name = r.u16()?;
            let argc = r.u8()?;
            Opcode::Super(name, argc)
        }
        73 => Opcode::SuperBind(r.u16()?),
        74 => Opcode::Return,
        75 => Opcode::NewList,
        76 => Opcode::AppendList,
        77 => Opcode::NewTuple(r.u8()?),
        78 => Opcode::NewTable,
        79 => Opcode::NewClosure(r.u16()?),
        80 => Opcode::CaptureLocal(r.u8()?),
        81 => Opcode::CaptureUpvalue(r.u8()?),
        82 => Opcode::NewClass(r.u16()?),
        83 => Opcode::NewSubclass(r.u16()?),
        84 => Opcode::DefMethod(r.u16()?),
        85 => {
            let name = r.u16()?;
            let nat = r.u16()?;
            Opcode::NatMethod(name, nat)
        }
        86 => Opcode::Native(r.u16()?),
        87 => Opcode::Unpack(r.u8()?),
        88 => Opcode::Import(r.u16()?),
        89 => {
            let name = r.u16()?;
            let alias = r.u16()?;
            Opcode::ImportAs(name, alias)
        }
        90 => Opcode::ImportFrom(r.u16()?),
        91 => {
            let m = r.u16()?;
            let n = r.u16()?;
            Opcode::ImportName(m, n)
        }
        92 => Opcode::SetupExcept(r.i16()?),
        93 => Opcode::SetupEnsure(r.i16()?),
        94 => Opcode::PopHandler,
        95 => Opcode::Raise,
        96 => Opcode::EndTry,
        t => return Err(DeserializeError::BadTag(t)),
    })
}


#[cfg(test)]
mod test {
    use crate::vm::builder::{Const, FunctionBuilder};
    use crate::vm::opcode::Opcode;
    use crate::vm::operator::BinaryOp;
    use crate::vm::serialize::{deserialize_function, serialize_function, DeserializeError};
    use crate::vm::value::Value;
    use crate::vm::{Config, Stack, VirtualMachine};

    fn sample_builder() -> FunctionBuilder {
        let mut inner = FunctionBuilder::new("inner");
        inner.arity = 2;
        let k = inner.num_const(10.0);
        inner
            .op(Opcode::GetLocal(1))
            .op(Opcode::GetLocal(2))
            .op(Opcode::Binary(BinaryOp::Add))
            .op(Opcode::Constant(k))
            .op(Opcode::Binary(BinaryOp::Mul))
            .op(Opcode::Return);

        let mut b = FunctionBuilder::new("sample");
        b.add_default(Const::Num(4.0));
        b.arity = 1;
        let f = b.fun_const(inner);
        let s = b.str_const("hello");
        b.line(3)
            .op(Opcode::NewClosure(f))
            .op(Opcode::GetLocal(1))
            .op(Opcode::Constant(s))
            .op(Opcode::Call(12))
            .op(Opcode::Invoke(s, 2))
            .op(Opcode::Jump(-4))
            .op(Opcode::SetupExcept(7))
            .op(Opcode::Return);
        b
    }

    #[test]
    fn test_round_trip_structure() {
        let mut vm = VirtualMachine::new(Config::default());
        let main = vm.main_module;
        let fun = sample_builder().build(&mut vm, main);

        let bytes = serialize_function(&vm, fun).unwrap();
        let loaded = deserialize_function(&mut vm, &bytes, main).unwrap();

        let a = vm.heap.as_fun(fun);
        let b = vm.heap.as_fun(loaded);
        assert_eq!(a.proto.name, b.proto.name);
        assert_eq!(a.proto.arity, b.proto.arity);
        assert_eq!(a.proto.vararg, b.proto.vararg);
        assert_eq!(a.proto.code, b.proto.code);
        assert_eq!(a.proto.lines, b.proto.lines);
        assert_eq!(a.consts.len(), b.consts.len());
        assert_eq!(a.defaults, b.defaults);

        // Interned string constants come back as the same handle.
        assert_eq!(a.consts[1], b.consts[1]);

        // The nested function round-trips too.
        let fa = vm.heap.as_fun(a.consts[0].as_obj());
        let fb = vm.heap.as_fun(b.consts[0].as_obj());
        assert_eq!(fa.proto.name, fb.proto.name);
        assert_eq!(fa.proto.code, fb.proto.code);

        vm.pop();
        vm.pop();
    }

    #[test]
    fn test_bad_magic() {
        let mut vm = VirtualMachine::new(Config::default());
        let main = vm.main_module;
        assert_eq!(
            Err(DeserializeError::BadMagic),
            deserialize_function(&mut vm, b"nope", main).map(|_| ())
        );
    }

    #[test]
    fn test_truncated() {
        let mut vm = VirtualMachine::new(Config::default());
        let main = vm.main_module;
        let fun = sample_builder().build(&mut vm, main);
        let bytes = serialize_function(&vm, fun).unwrap();
        assert_eq!(
            Err(DeserializeError::Truncated),
            deserialize_function(&mut vm, &bytes[..bytes.len() - 3], main).map(|_| ())
        );
    }

    #[test]
    fn test_unserializable_runtime_constant() {
        let mut vm = VirtualMachine::new(Config::default());
        let main = vm.main_module;
        let mut b = FunctionBuilder::new("bad");
        b.add_const(Const::Null);
        let fun = b.build(&mut vm, main);
        // Simulate DefMethod patching a class into constant slot 0.
        let cls = vm.builtins.object;
        vm.heap.as_fun_mut(fun).consts[0] = Value::Obj(cls);
        assert!(serialize_function(&vm, fun).is_err());
        vm.pop();
    }
}
