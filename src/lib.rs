mod ast;
mod compiler;
mod event_loop;
mod heap;
mod jit;
mod native;
mod object;
mod parser;
mod scanner;
mod token;
mod value;
mod vm;

pub use self::{
    ast::{Expr, FunctionDecl, LiteralValue, Stmt},
    compiler::Compiler,
    event_loop::{EventTask, TimerQueue},
    heap::Heap,
    jit::{JitCompiler, JitFn},
    native::HandleRegistry,
    object::{
        BoundMethod, Chunk, Class, Closure, Function, Instance, JitState,
        MethodRef, Native, NativeFn, Obj, Opcode, Upvalue,
    },
    parser::Parser,
    scanner::Scanner,
    token::{Literal, Token, TokenKind},
    value::{format_number, Value},
    vm::{CallFrame, Vm},
};
