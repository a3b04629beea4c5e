use crate::object::{Chunk, Opcode};
use crate::value::Value as RuntimeValue;
use cranelift::prelude::*;
use cranelift_jit::{JITBuilder, JITModule};
use cranelift_module::{Linkage, Module};
use std::collections::HashMap;
use std::mem;

/// Signature of a specialised function: packed double arguments in, one
/// double out. The argument buffer is read-only; locals the function writes
/// live in SSA variables.
pub type JitFn = unsafe extern "C" fn(*const f64) -> f64;

/// Per-VM native specialiser for numeric hot paths. Translates the
/// straight-line numeric subset of the instruction set and refuses anything
/// else. The underlying module owns the executable buffers, so compiled
/// pointers stay valid as long as the compiler itself is alive.
pub struct JitCompiler {
    module: JITModule,
    builder_context: FunctionBuilderContext,
    counter: usize,
}

impl JitCompiler {
    pub fn new() -> Option<Self> {
        let builder =
            JITBuilder::new(cranelift_module::default_libcall_names()).ok()?;
        Some(Self {
            module: JITModule::new(builder),
            builder_context: FunctionBuilderContext::new(),
            counter: 0,
        })
    }

    /// Translates `chunk`, producing a callable or `None` when the chunk
    /// steps outside the supported subset:
    /// `{CONSTANT(number), GET_LOCAL, SET_LOCAL, ADD, SUB, MUL, RETURN}`.
    pub fn compile(&mut self, chunk: &Chunk) -> Option<JitFn> {
        // Reject unsupported chunks before touching builder state, so an
        // abandoned half-built function never poisons the context.
        if !subset_supported(chunk) {
            return None;
        }

        let mut ctx = self.module.make_context();
        let pointer_type = self.module.target_config().pointer_type();

        let mut signature = self.module.make_signature();
        signature.params.push(AbiParam::new(pointer_type));
        signature.returns.push(AbiParam::new(types::F64));
        ctx.func.signature = signature.clone();

        {
            let mut builder =
                FunctionBuilder::new(&mut ctx.func, &mut self.builder_context);
            let entry = builder.create_block();
            builder.append_block_params_for_function_params(entry);
            builder.switch_to_block(entry);
            builder.seal_block(entry);
            let args_pointer = builder.block_params(entry)[0];

            if !translate(chunk, &mut builder, args_pointer) {
                return None;
            }
            builder.finalize();
        }

        let name = format!("specialised_{}", self.counter);
        self.counter += 1;
        let id = self
            .module
            .declare_function(&name, Linkage::Export, &signature)
            .ok()?;
        self.module.define_function(id, &mut ctx).ok()?;
        self.module.clear_context(&mut ctx);
        self.module.finalize_definitions().ok()?;

        let code = self.module.get_finalized_function(id);
        Some(unsafe { mem::transmute::<*const u8, JitFn>(code) })
    }
}

/// Decode-only dry run: checks every instruction is in the subset, every
/// constant is numeric, and the simulated stack never underflows before the
/// terminating RETURN.
fn subset_supported(chunk: &Chunk) -> bool {
    let mut depth = 0usize;
    let mut ip = 0;
    while ip < chunk.code.len() {
        let Some(op) = Opcode::from_byte(chunk.code[ip]) else {
            return false;
        };
        ip += 1;
        match op {
            Opcode::Constant => {
                if ip + 1 >= chunk.code.len() {
                    return false;
                }
                let index = chunk.read_u16(ip) as usize;
                ip += 2;
                match chunk.constants.get(index) {
                    Some(RuntimeValue::Number(_)) => depth += 1,
                    _ => return false,
                }
            }
            Opcode::GetLocal => {
                if ip >= chunk.code.len() {
                    return false;
                }
                ip += 1;
                depth += 1;
            }
            Opcode::SetLocal => {
                if ip >= chunk.code.len() || depth == 0 {
                    return false;
                }
                ip += 1;
            }
            Opcode::Add | Opcode::Sub | Opcode::Mul => {
                if depth < 2 {
                    return false;
                }
                depth -= 1;
            }
            Opcode::Return => return depth >= 1,
            _ => return false,
        }
    }
    false
}

/// Walks the bytecode, mirroring the VM's operand stack with compile-time
/// SSA values. Returns false on any instruction outside the subset.
fn translate(
    chunk: &Chunk,
    builder: &mut FunctionBuilder,
    args_pointer: Value,
) -> bool {
    let mut stack: Vec<Value> = Vec::new();
    let mut locals: HashMap<u8, Variable> = HashMap::new();
    let mut ip = 0;

    while ip < chunk.code.len() {
        let Some(op) = Opcode::from_byte(chunk.code[ip]) else {
            return false;
        };
        ip += 1;
        match op {
            Opcode::Constant => {
                if ip + 1 >= chunk.code.len() {
                    return false;
                }
                let index = chunk.read_u16(ip) as usize;
                ip += 2;
                let RuntimeValue::Number(n) = chunk.constants[index] else {
                    return false;
                };
                stack.push(builder.ins().f64const(n));
            }
            Opcode::GetLocal => {
                let slot = chunk.code[ip];
                ip += 1;
                let value = if let Some(var) = locals.get(&slot) {
                    builder.use_var(*var)
                } else if slot == 0 {
                    // The reserved receiver slot has no numeric payload.
                    builder.ins().f64const(0.0)
                } else {
                    let offset = (slot as i32 - 1) * 8;
                    builder.ins().load(
                        types::F64,
                        MemFlags::trusted(),
                        args_pointer,
                        offset,
                    )
                };
                stack.push(value);
            }
            Opcode::SetLocal => {
                let slot = chunk.code[ip];
                ip += 1;
                // The interpreter's SET_LOCAL peeks rather than pops; the
                // assigned value stays on the stack for the enclosing
                // expression.
                let Some(&value) = stack.last() else {
                    return false;
                };
                let var = *locals.entry(slot).or_insert_with(|| {
                    let var = Variable::new(slot as usize);
                    builder.declare_var(var, types::F64);
                    var
                });
                builder.def_var(var, value);
            }
            Opcode::Add | Opcode::Sub | Opcode::Mul => {
                let (Some(right), Some(left)) = (stack.pop(), stack.pop())
                else {
                    return false;
                };
                let result = match op {
                    Opcode::Add => builder.ins().fadd(left, right),
                    Opcode::Sub => builder.ins().fsub(left, right),
                    _ => builder.ins().fmul(left, right),
                };
                stack.push(result);
            }
            Opcode::Return => {
                let Some(result) = stack.pop() else {
                    return false;
                };
                builder.ins().return_(&[result]);
                return true;
            }
            _ => return false,
        }
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chunk_of(code: &[u8], constants: &[f64]) -> Chunk {
        Chunk {
            code: code.to_vec(),
            constants: constants.iter().map(|&n| RuntimeValue::Number(n)).collect(),
        }
    }

    #[test]
    fn test_compiles_constant_return() {
        let mut jit = JitCompiler::new().expect("host supported");
        let chunk = chunk_of(
            &[Opcode::Constant as u8, 0, 0, Opcode::Return as u8],
            &[42.0],
        );
        let function = jit.compile(&chunk).expect("subset compiles");
        let args = [0.0f64];
        assert_eq!(unsafe { function(args.as_ptr()) }, 42.0);
    }

    #[test]
    fn test_compiles_argument_arithmetic() {
        let mut jit = JitCompiler::new().expect("host supported");
        // fn(a, b) { return a * b + 1; } over slots 1 and 2.
        let chunk = chunk_of(
            &[
                Opcode::GetLocal as u8, 1,
                Opcode::GetLocal as u8, 2,
                Opcode::Mul as u8,
                Opcode::Constant as u8, 0, 0,
                Opcode::Add as u8,
                Opcode::Return as u8,
            ],
            &[1.0],
        );
        let function = jit.compile(&chunk).expect("subset compiles");
        let args = [6.0f64, 7.0];
        assert_eq!(unsafe { function(args.as_ptr()) }, 43.0);
    }

    #[test]
    fn test_set_local_keeps_value_on_stack() {
        let mut jit = JitCompiler::new().expect("host supported");
        // return (a = a + 1); — the store peeks, so the sum is returned.
        let chunk = chunk_of(
            &[
                Opcode::GetLocal as u8, 1,
                Opcode::Constant as u8, 0, 0,
                Opcode::Add as u8,
                Opcode::SetLocal as u8, 1,
                Opcode::Return as u8,
            ],
            &[1.0],
        );
        let function = jit.compile(&chunk).expect("subset compiles");
        let args = [9.0f64];
        assert_eq!(unsafe { function(args.as_ptr()) }, 10.0);
    }

    #[test]
    fn test_refuses_unsupported_opcodes() {
        let mut jit = JitCompiler::new().expect("host supported");
        let div = chunk_of(
            &[
                Opcode::Constant as u8, 0, 0,
                Opcode::Constant as u8, 0, 0,
                Opcode::Div as u8,
                Opcode::Return as u8,
            ],
            &[2.0],
        );
        assert!(jit.compile(&div).is_none());

        let call = chunk_of(&[Opcode::Call as u8, 0, Opcode::Return as u8], &[]);
        assert!(jit.compile(&call).is_none());
    }

    #[test]
    fn test_refuses_non_numeric_constants() {
        let mut jit = JitCompiler::new().expect("host supported");
        let chunk = Chunk {
            code: vec![Opcode::Constant as u8, 0, 0, Opcode::Return as u8],
            constants: vec![RuntimeValue::Null],
        };
        assert!(jit.compile(&chunk).is_none());
    }

    #[test]
    fn test_refuses_chunk_without_return() {
        let mut jit = JitCompiler::new().expect("host supported");
        let chunk = chunk_of(&[Opcode::Constant as u8, 0, 0], &[1.0]);
        assert!(jit.compile(&chunk).is_none());
    }
}
