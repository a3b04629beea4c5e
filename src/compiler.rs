use crate::ast::{Expr, FunctionDecl, LiteralValue, Stmt};
use crate::object::{Chunk, Function, Obj, Opcode};
use crate::token::{Token, TokenKind};
use crate::value::Value;
use crate::vm::Vm;
use anyhow::{anyhow, bail, Result};

const MAX_LOCALS: usize = u8::MAX as usize + 1;

#[derive(Debug, Clone)]
pub struct Local {
    pub name: String,
    pub depth: i32,
    pub is_captured: bool,
    pub is_const: bool,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct UpvalueRef {
    pub index: u8,
    pub is_local: bool,
    pub is_const: bool,
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum FunctionKind {
    Script,
    Function,
    Method,
    Constructor,
}

/// One frame per function being compiled. Slot 0 is the reserved receiver
/// slot: `this` inside methods, unnameable otherwise.
struct CompilerState {
    function: Function,
    kind: FunctionKind,
    locals: Vec<Local>,
    upvalues: Vec<UpvalueRef>,
    scope_depth: i32,
}

impl CompilerState {
    fn new(name: &str, kind: FunctionKind) -> Self {
        let receiver = Local {
            name: if matches!(kind, FunctionKind::Method | FunctionKind::Constructor)
            {
                "this".to_string()
            } else {
                String::new()
            },
            depth: 0,
            is_captured: false,
            is_const: true,
        };
        let mut function = Function::default();
        function.name = name.to_string();
        Self {
            function,
            kind,
            locals: vec![receiver],
            upvalues: Vec::new(),
            scope_depth: 0,
        }
    }
}

/// Single-pass bytecode compiler. Walks the AST once, resolving every
/// identifier to a local slot, an upvalue chain, or a global name constant,
/// and emits straight into the chunk of the function under construction.
///
/// Heap objects created while compiling (name strings, finished functions)
/// are pushed on the VM's temp-roots stack so a collection triggered by a
/// later allocation cannot reclaim them; the roots are released when the
/// top-level compile completes.
pub struct Compiler<'a> {
    vm: &'a mut Vm,
    states: Vec<CompilerState>,
}

impl<'a> Compiler<'a> {
    pub fn new(vm: &'a mut Vm) -> Self {
        Self {
            vm,
            states: Vec::new(),
        }
    }

    /// Compiles a program into the implicit top-level `<script>` function and
    /// returns its heap handle.
    pub fn compile(mut self, statements: &[Stmt]) -> Result<u32> {
        let roots_depth = self.vm.temp_roots.len();
        let result = self.compile_script(statements);
        self.vm.temp_roots.truncate(roots_depth);
        result
    }

    fn compile_script(&mut self, statements: &[Stmt]) -> Result<u32> {
        self.states
            .push(CompilerState::new("<script>", FunctionKind::Script));
        for statement in statements {
            self.compile_stmt(statement)?;
        }
        self.emit_op(Opcode::Nil);
        self.emit_op(Opcode::Return);
        let state = self.states.pop().unwrap();
        let handle = self.vm.allocate(Obj::Function(state.function));
        self.vm.temp_roots.push(handle);
        Ok(handle)
    }

    fn state(&mut self) -> &mut CompilerState {
        self.states.last_mut().unwrap()
    }

    fn chunk(&mut self) -> &mut Chunk {
        &mut self.state().function.chunk
    }

    fn emit_byte(&mut self, byte: u8) {
        self.chunk().write(byte);
    }

    fn emit_op(&mut self, op: Opcode) {
        self.emit_byte(op as u8);
    }

    fn emit_u16(&mut self, value: u16) {
        let [high, low] = value.to_be_bytes();
        self.emit_byte(high);
        self.emit_byte(low);
    }

    fn emit_op_u16(&mut self, op: Opcode, operand: u16) {
        self.emit_op(op);
        self.emit_u16(operand);
    }

    fn emit_op_u8(&mut self, op: Opcode, operand: u8) {
        self.emit_op(op);
        self.emit_byte(operand);
    }

    fn emit_jump(&mut self, op: Opcode) -> usize {
        self.emit_op(op);
        self.emit_byte(0xff);
        self.emit_byte(0xff);
        self.chunk().code.len() - 2
    }

    fn patch_jump(&mut self, offset: usize) -> Result<()> {
        let jump = self.chunk().code.len() - offset - 2;
        if jump > u16::MAX as usize {
            bail!("Too much code to jump over.");
        }
        let [high, low] = (jump as u16).to_be_bytes();
        self.chunk().code[offset] = high;
        self.chunk().code[offset + 1] = low;
        Ok(())
    }

    fn emit_loop(&mut self, loop_start: usize) -> Result<()> {
        self.emit_op(Opcode::Loop);
        let offset = self.chunk().code.len() - loop_start + 2;
        if offset > u16::MAX as usize {
            bail!("Loop body too large.");
        }
        self.emit_u16(offset as u16);
        Ok(())
    }

    fn make_constant(&mut self, value: Value) -> u16 {
        self.chunk().add_constant(value)
    }

    fn string_constant(&mut self, text: &str) -> u16 {
        let handle = self.vm.allocate(Obj::String(text.to_string()));
        self.vm.temp_roots.push(handle);
        self.make_constant(Value::Obj(handle))
    }

    fn resolve_local(state: &CompilerState, name: &str) -> Option<usize> {
        state
            .locals
            .iter()
            .rposition(|local| local.name == name)
    }

    fn add_upvalue(
        &mut self,
        state_index: usize,
        index: u8,
        is_local: bool,
        is_const: bool,
    ) -> usize {
        let state = &mut self.states[state_index];
        for (i, upvalue) in state.upvalues.iter().enumerate() {
            if upvalue.index == index && upvalue.is_local == is_local {
                return i;
            }
        }
        state.upvalues.push(UpvalueRef {
            index,
            is_local,
            is_const,
        });
        state.function.upvalue_count += 1;
        state.function.upvalue_count - 1
    }

    /// Walks outward through enclosing compiler frames looking for `name`.
    /// A hit as a local marks that local captured and threads an upvalue
    /// entry through every intermediate frame.
    fn resolve_upvalue(
        &mut self,
        state_index: usize,
        name: &str,
    ) -> Option<(usize, bool)> {
        if state_index == 0 {
            return None;
        }
        let enclosing = state_index - 1;

        if let Some(local) = Self::resolve_local(&self.states[enclosing], name) {
            let is_const = self.states[enclosing].locals[local].is_const;
            self.states[enclosing].locals[local].is_captured = true;
            let index =
                self.add_upvalue(state_index, local as u8, true, is_const);
            return Some((index, is_const));
        }

        if let Some((upvalue, is_const)) = self.resolve_upvalue(enclosing, name) {
            let index =
                self.add_upvalue(state_index, upvalue as u8, false, is_const);
            return Some((index, is_const));
        }

        None
    }

    fn begin_scope(&mut self) {
        self.state().scope_depth += 1;
    }

    fn end_scope(&mut self) {
        self.state().scope_depth -= 1;
        loop {
            let state = self.states.last().unwrap();
            let leaving = state
                .locals
                .last()
                .map(|local| local.depth > state.scope_depth)
                .unwrap_or(false);
            if !leaving {
                break;
            }
            let local = self.state().locals.pop().unwrap();
            if local.is_captured {
                self.emit_op(Opcode::CloseUpvalue);
            } else {
                self.emit_op(Opcode::Pop);
            }
        }
    }

    fn declare_local(&mut self, name: &Token, is_const: bool) -> Result<()> {
        let state = self.state();
        if state.locals.len() >= MAX_LOCALS {
            bail!(
                "[line {}] Error: Too many local variables in function.",
                name.line
            );
        }
        let depth = state.scope_depth;
        state.locals.push(Local {
            name: name.lexeme.clone(),
            depth,
            is_captured: false,
            is_const,
        });
        Ok(())
    }

    pub fn compile_stmt(&mut self, statement: &Stmt) -> Result<()> {
        match statement {
            Stmt::Expression(expr) => {
                self.compile_expr(expr)?;
                self.emit_op(Opcode::Pop);
            }
            Stmt::Var {
                name,
                initializer,
                is_const,
            } => {
                match initializer {
                    Some(expr) => self.compile_expr(expr)?,
                    None => self.emit_op(Opcode::Nil),
                }
                if self.state().scope_depth > 0 {
                    self.declare_local(name, *is_const)?;
                } else {
                    let index = self.string_constant(&name.lexeme);
                    let op = if *is_const {
                        Opcode::DefineGlobalConst
                    } else {
                        Opcode::DefineGlobal
                    };
                    self.emit_op_u16(op, index);
                }
            }
            Stmt::Block(statements) => {
                self.begin_scope();
                for statement in statements {
                    self.compile_stmt(statement)?;
                }
                self.end_scope();
            }
            Stmt::If {
                condition,
                then_branch,
                else_branch,
            } => {
                self.compile_expr(condition)?;
                let else_jump = self.emit_jump(Opcode::JumpIfFalse);
                self.emit_op(Opcode::Pop);
                self.compile_stmt(then_branch)?;
                let end_jump = self.emit_jump(Opcode::Jump);
                self.patch_jump(else_jump)?;
                self.emit_op(Opcode::Pop);
                if let Some(else_branch) = else_branch {
                    self.compile_stmt(else_branch)?;
                }
                self.patch_jump(end_jump)?;
            }
            Stmt::While { condition, body } => {
                let loop_start = self.chunk().code.len();
                self.compile_expr(condition)?;
                let exit_jump = self.emit_jump(Opcode::JumpIfFalse);
                self.emit_op(Opcode::Pop);
                self.compile_stmt(body)?;
                self.emit_loop(loop_start)?;
                self.patch_jump(exit_jump)?;
                self.emit_op(Opcode::Pop);
            }
            Stmt::Function(decl) => {
                self.compile_function_decl(decl)?;
            }
            Stmt::Return { keyword, value } => {
                let in_constructor =
                    self.state().kind == FunctionKind::Constructor;
                match value {
                    Some(expr) => {
                        if in_constructor {
                            bail!(
                                "[line {}] Error: Cannot return a value from a constructor.",
                                keyword.line
                            );
                        }
                        self.compile_expr(expr)?;
                    }
                    None if in_constructor => {
                        self.emit_op_u8(Opcode::GetLocal, 0);
                    }
                    None => self.emit_op(Opcode::Nil),
                }
                self.emit_op(Opcode::Return);
            }
            Stmt::Class { name, methods } => {
                let name_index = self.string_constant(&name.lexeme);
                self.emit_op_u16(Opcode::Class, name_index);
                self.emit_op_u16(Opcode::DefineGlobal, name_index);
                self.emit_op_u16(Opcode::GetGlobal, name_index);
                for method in methods {
                    let method_name = method
                        .name
                        .as_ref()
                        .map(|t| t.lexeme.clone())
                        .unwrap_or_default();
                    let method_index = self.string_constant(&method_name);
                    let kind = if method_name == "constructor" {
                        FunctionKind::Constructor
                    } else {
                        FunctionKind::Method
                    };
                    self.compile_function(method, kind)?;
                    self.emit_op_u16(Opcode::Method, method_index);
                }
                self.emit_op(Opcode::Pop);
            }
            Stmt::Import { specifiers, path } => {
                // Each specifier re-enters `require`; the module cache makes
                // the repeated calls cheap.
                for specifier in specifiers {
                    let require_index = self.string_constant("require");
                    self.emit_op_u16(Opcode::GetGlobal, require_index);
                    let path_index = self.string_constant(path.string());
                    self.emit_op_u16(Opcode::Constant, path_index);
                    self.emit_op_u8(Opcode::Call, 1);
                    let name_index = self.string_constant(&specifier.lexeme);
                    self.emit_op_u16(Opcode::GetProperty, name_index);
                    self.emit_op_u16(Opcode::DefineGlobal, name_index);
                }
            }
            Stmt::Export { specifiers } => {
                for specifier in specifiers {
                    let exports_index = self.string_constant("exports");
                    self.emit_op_u16(Opcode::GetGlobal, exports_index);
                    let name_index = self.string_constant(&specifier.lexeme);
                    self.emit_op_u16(Opcode::GetGlobal, name_index);
                    self.emit_op_u16(Opcode::SetProperty, name_index);
                    self.emit_op(Opcode::Pop);
                }
            }
        }
        Ok(())
    }

    /// A `function name(...) {...}` declaration: binds a local in nested
    /// scopes (before the body compiles, so recursion resolves) or a global
    /// at the top level.
    fn compile_function_decl(&mut self, decl: &FunctionDecl) -> Result<()> {
        let name = decl.name.as_ref().expect("declaration has a name");
        let mut global_index = None;
        if self.state().scope_depth > 0 {
            self.declare_local(name, false)?;
        } else {
            global_index = Some(self.string_constant(&name.lexeme));
        }
        self.compile_function(decl, FunctionKind::Function)?;
        if let Some(index) = global_index {
            self.emit_op_u16(Opcode::DefineGlobal, index);
        }
        Ok(())
    }

    /// Compiles a function body in a fresh compiler frame and emits the
    /// `MAKE_CLOSURE` sequence (constant index, then one `(is_local, index)`
    /// byte pair per captured upvalue) into the enclosing chunk.
    fn compile_function(
        &mut self,
        decl: &FunctionDecl,
        kind: FunctionKind,
    ) -> Result<()> {
        let name = decl
            .name
            .as_ref()
            .map(|t| t.lexeme.clone())
            .unwrap_or_default();
        let mut state = CompilerState::new(&name, kind);
        state.scope_depth = 1;
        state.function.arity = decl.params.len();
        self.states.push(state);

        for param in &decl.params {
            self.declare_local(param, false)?;
        }
        for statement in &decl.body {
            self.compile_stmt(statement)?;
        }

        // Implicit epilogue; unreachable when the body always returns.
        if self.state().kind == FunctionKind::Constructor {
            self.emit_op_u8(Opcode::GetLocal, 0);
        } else {
            self.emit_op(Opcode::Nil);
        }
        self.emit_op(Opcode::Return);

        let state = self.states.pop().unwrap();
        let upvalues = state.upvalues.clone();
        let handle = self.vm.allocate(Obj::Function(state.function));
        self.vm.temp_roots.push(handle);

        let index = self.make_constant(Value::Obj(handle));
        self.emit_op_u16(Opcode::MakeClosure, index);
        for upvalue in upvalues {
            self.emit_byte(upvalue.is_local as u8);
            self.emit_byte(upvalue.index);
        }
        Ok(())
    }

    pub fn compile_expr(&mut self, expr: &Expr) -> Result<()> {
        match expr {
            Expr::Literal(literal) => self.compile_literal(literal),
            Expr::Ternary {
                condition,
                then_expr,
                else_expr,
            } => {
                self.compile_expr(condition)?;
                let else_jump = self.emit_jump(Opcode::JumpIfFalse);
                self.emit_op(Opcode::Pop);
                self.compile_expr(then_expr)?;
                let end_jump = self.emit_jump(Opcode::Jump);
                self.patch_jump(else_jump)?;
                self.emit_op(Opcode::Pop);
                self.compile_expr(else_expr)?;
                self.patch_jump(end_jump)?;
                Ok(())
            }
            Expr::Binary { left, op, right } => {
                self.compile_binary(left, op, right)
            }
            Expr::Unary { op, right } => {
                self.compile_expr(right)?;
                match op.kind {
                    TokenKind::Bang => self.emit_op(Opcode::Not),
                    TokenKind::Minus => self.emit_op(Opcode::Negate),
                    _ => bail!(
                        "[line {}] Error: Unsupported unary operator '{}'.",
                        op.line,
                        op.lexeme
                    ),
                }
                Ok(())
            }
            Expr::Variable { name } => self.compile_variable_get(name),
            Expr::Assign { name, value } => {
                self.compile_expr(value)?;
                self.compile_variable_set(name)
            }
            Expr::Update {
                name,
                is_increment,
                is_postfix,
            } => self.compile_update(name, *is_increment, *is_postfix),
            Expr::Call { callee, args } => {
                self.compile_expr(callee)?;
                self.compile_args(args, name_line(callee))?;
                self.emit_op_u8(Opcode::Call, args.len() as u8);
                Ok(())
            }
            Expr::New { callee, args } => {
                self.compile_expr(callee)?;
                self.compile_args(args, name_line(callee))?;
                self.emit_op_u8(Opcode::New, args.len() as u8);
                Ok(())
            }
            Expr::List(elements) => {
                if elements.len() > u8::MAX as usize {
                    bail!("Too many elements in list literal.");
                }
                for element in elements {
                    self.compile_expr(element)?;
                }
                self.emit_op_u8(Opcode::BuildList, elements.len() as u8);
                Ok(())
            }
            Expr::Object(properties) => {
                if properties.len() > u8::MAX as usize {
                    bail!("Too many properties in object literal.");
                }
                for (key, value) in properties {
                    let key_text = if key.kind == TokenKind::String {
                        key.string().to_string()
                    } else {
                        key.lexeme.clone()
                    };
                    let key_index = self.string_constant(&key_text);
                    self.emit_op_u16(Opcode::Constant, key_index);
                    self.compile_expr(value)?;
                }
                self.emit_op_u8(Opcode::BuildObject, properties.len() as u8);
                Ok(())
            }
            Expr::GetSubscript { target, index } => {
                self.compile_expr(target)?;
                self.compile_expr(index)?;
                self.emit_op(Opcode::GetSubscript);
                Ok(())
            }
            Expr::SetSubscript {
                target,
                index,
                value,
            } => {
                self.compile_expr(target)?;
                self.compile_expr(index)?;
                self.compile_expr(value)?;
                self.emit_op(Opcode::SetSubscript);
                Ok(())
            }
            Expr::This { keyword } => self.compile_variable_get(keyword),
            Expr::Get { object, name } => {
                self.compile_expr(object)?;
                let index = self.string_constant(&name.lexeme);
                self.emit_op_u16(Opcode::GetProperty, index);
                Ok(())
            }
            Expr::Set {
                object,
                name,
                value,
            } => {
                self.compile_expr(object)?;
                self.compile_expr(value)?;
                let index = self.string_constant(&name.lexeme);
                self.emit_op_u16(Opcode::SetProperty, index);
                Ok(())
            }
            Expr::Function(decl) => {
                self.compile_function(decl, FunctionKind::Function)
            }
        }
    }

    fn compile_literal(&mut self, literal: &LiteralValue) -> Result<()> {
        match literal {
            LiteralValue::Null => self.emit_op(Opcode::Nil),
            LiteralValue::Bool(true) => self.emit_op(Opcode::True),
            LiteralValue::Bool(false) => self.emit_op(Opcode::False),
            LiteralValue::Number(n) => {
                let index = self.make_constant(Value::Number(*n));
                self.emit_op_u16(Opcode::Constant, index);
            }
            LiteralValue::Str(s) => {
                let index = self.string_constant(s);
                self.emit_op_u16(Opcode::Constant, index);
            }
        }
        Ok(())
    }

    fn compile_binary(
        &mut self,
        left: &Expr,
        op: &Token,
        right: &Expr,
    ) -> Result<()> {
        // Logical operators short-circuit, so the right operand compiles
        // behind a jump rather than unconditionally.
        match op.kind {
            TokenKind::AndAnd => {
                self.compile_expr(left)?;
                let end_jump = self.emit_jump(Opcode::JumpIfFalse);
                self.emit_op(Opcode::Pop);
                self.compile_expr(right)?;
                self.patch_jump(end_jump)?;
                return Ok(());
            }
            TokenKind::OrOr => {
                self.compile_expr(left)?;
                let end_jump = self.emit_jump(Opcode::JumpIfTrue);
                self.emit_op(Opcode::Pop);
                self.compile_expr(right)?;
                self.patch_jump(end_jump)?;
                return Ok(());
            }
            _ => {}
        }

        self.compile_expr(left)?;
        self.compile_expr(right)?;
        match op.kind {
            TokenKind::Plus => self.emit_op(Opcode::Add),
            TokenKind::Minus => self.emit_op(Opcode::Sub),
            TokenKind::Star => self.emit_op(Opcode::Mul),
            TokenKind::Slash => self.emit_op(Opcode::Div),
            TokenKind::Percent => self.emit_op(Opcode::Mod),
            TokenKind::EqualEqual => self.emit_op(Opcode::Equal),
            TokenKind::BangEqual => {
                self.emit_op(Opcode::Equal);
                self.emit_op(Opcode::Not);
            }
            TokenKind::EqualEqualEqual => self.emit_op(Opcode::StrictEqual),
            TokenKind::BangEqualEqual => self.emit_op(Opcode::StrictNotEqual),
            TokenKind::Less => self.emit_op(Opcode::Less),
            TokenKind::Greater => self.emit_op(Opcode::Greater),
            TokenKind::LessEqual => {
                self.emit_op(Opcode::Greater);
                self.emit_op(Opcode::Not);
            }
            TokenKind::GreaterEqual => {
                self.emit_op(Opcode::Less);
                self.emit_op(Opcode::Not);
            }
            _ => bail!(
                "[line {}] Error: Unsupported binary operator '{}'.",
                op.line,
                op.lexeme
            ),
        }
        Ok(())
    }

    fn compile_args(&mut self, args: &[Expr], line: usize) -> Result<()> {
        if args.len() > u8::MAX as usize {
            bail!("[line {}] Error: Too many arguments.", line);
        }
        for arg in args {
            self.compile_expr(arg)?;
        }
        Ok(())
    }

    /// Exactly one of local / upvalue / global is chosen, in that order.
    fn compile_variable_get(&mut self, name: &Token) -> Result<()> {
        let state_index = self.states.len() - 1;
        if let Some(slot) = Self::resolve_local(self.states.last().unwrap(), &name.lexeme)
        {
            self.emit_op_u8(Opcode::GetLocal, slot as u8);
        } else if let Some((index, _)) =
            self.resolve_upvalue(state_index, &name.lexeme)
        {
            self.emit_op_u8(Opcode::GetUpvalue, index as u8);
        } else {
            let index = self.string_constant(&name.lexeme);
            self.emit_op_u16(Opcode::GetGlobal, index);
        }
        Ok(())
    }

    fn compile_variable_set(&mut self, name: &Token) -> Result<()> {
        let state_index = self.states.len() - 1;
        if let Some(slot) = Self::resolve_local(self.states.last().unwrap(), &name.lexeme)
        {
            if self.states.last().unwrap().locals[slot].is_const {
                return Err(self.const_error(name));
            }
            self.emit_op_u8(Opcode::SetLocal, slot as u8);
        } else if let Some((index, is_const)) =
            self.resolve_upvalue(state_index, &name.lexeme)
        {
            if is_const {
                return Err(self.const_error(name));
            }
            self.emit_op_u8(Opcode::SetUpvalue, index as u8);
        } else {
            // Globals declared const are caught at runtime via the VM's
            // const-name set.
            let index = self.string_constant(&name.lexeme);
            self.emit_op_u16(Opcode::SetGlobal, index);
        }
        Ok(())
    }

    fn const_error(&self, name: &Token) -> anyhow::Error {
        anyhow!(
            "[line {}] Error: Cannot assign to const variable '{}'.",
            name.line,
            name.lexeme
        )
    }

    /// Prefix form leaves the updated value on the stack; postfix recomputes
    /// the original by undoing the step after the store.
    fn compile_update(
        &mut self,
        name: &Token,
        is_increment: bool,
        is_postfix: bool,
    ) -> Result<()> {
        enum Target {
            Local(u8),
            Upvalue(u8),
            Global(u16),
        }

        let state_index = self.states.len() - 1;
        let target = if let Some(slot) =
            Self::resolve_local(self.states.last().unwrap(), &name.lexeme)
        {
            if self.states.last().unwrap().locals[slot].is_const {
                return Err(self.const_error(name));
            }
            Target::Local(slot as u8)
        } else if let Some((index, is_const)) =
            self.resolve_upvalue(state_index, &name.lexeme)
        {
            if is_const {
                return Err(self.const_error(name));
            }
            Target::Upvalue(index as u8)
        } else {
            Target::Global(self.string_constant(&name.lexeme))
        };

        match &target {
            Target::Local(slot) => self.emit_op_u8(Opcode::GetLocal, *slot),
            Target::Upvalue(index) => self.emit_op_u8(Opcode::GetUpvalue, *index),
            Target::Global(index) => self.emit_op_u16(Opcode::GetGlobal, *index),
        }

        let one = self.make_constant(Value::Number(1.0));
        self.emit_op_u16(Opcode::Constant, one);
        self.emit_op(if is_increment { Opcode::Add } else { Opcode::Sub });

        match &target {
            Target::Local(slot) => self.emit_op_u8(Opcode::SetLocal, *slot),
            Target::Upvalue(index) => self.emit_op_u8(Opcode::SetUpvalue, *index),
            Target::Global(index) => self.emit_op_u16(Opcode::SetGlobal, *index),
        }

        if is_postfix {
            self.emit_op_u16(Opcode::Constant, one);
            self.emit_op(if is_increment { Opcode::Sub } else { Opcode::Add });
        }
        Ok(())
    }
}

fn name_line(expr: &Expr) -> usize {
    match expr {
        Expr::Variable { name } => name.line,
        Expr::Get { name, .. } => name.line,
        _ => 0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::Parser;
    use crate::scanner::Scanner;

    fn compile_source(vm: &mut Vm, source: &str) -> Result<u32> {
        let tokens = Scanner::new(source).scan_tokens();
        let statements = Parser::new(&tokens, "test").parse()?;
        Compiler::new(vm).compile(&statements)
    }

    fn script_code(vm: &Vm, handle: u32) -> Vec<u8> {
        match vm.heap.get(handle) {
            Obj::Function(f) => f.chunk.code.clone(),
            other => panic!("expected function, got {other:?}"),
        }
    }

    #[test]
    fn test_expression_statement_bytecode() -> Result<()> {
        let mut vm = Vm::new();
        let script = compile_source(&mut vm, "1 + 2;")?;
        assert_eq!(
            script_code(&vm, script),
            vec![
                Opcode::Constant as u8, 0, 0,
                Opcode::Constant as u8, 0, 1,
                Opcode::Add as u8,
                Opcode::Pop as u8,
                Opcode::Nil as u8,
                Opcode::Return as u8,
            ]
        );
        Ok(())
    }

    #[test]
    fn test_const_assignment_is_a_compile_error() {
        let mut vm = Vm::new();
        let err = compile_source(&mut vm, "{ const k = 1; k = 2; }").unwrap_err();
        assert!(err.to_string().contains("k"), "{err}");
        assert!(err.to_string().contains("const"), "{err}");
    }

    #[test]
    fn test_const_update_is_a_compile_error() {
        let mut vm = Vm::new();
        let err = compile_source(&mut vm, "{ const k = 1; k++; }").unwrap_err();
        assert!(err.to_string().contains("k"), "{err}");
    }

    #[test]
    fn test_closure_captures_emit_upvalue_pairs() -> Result<()> {
        let mut vm = Vm::new();
        let script = compile_source(
            &mut vm,
            "function mk() { var i = 0; return function() { i = i + 1; return i; }; }",
        )?;
        let code = script_code(&vm, script);
        // The outer function is a top-level declaration; the inner closure's
        // MAKE_CLOSURE must carry one (is_local = 1, index = 1) pair.
        let outer_handle = match vm.heap.get(script) {
            Obj::Function(f) => f.chunk.constants[1].as_obj().unwrap(),
            other => panic!("expected function, got {other:?}"),
        };
        let outer = match vm.heap.get(outer_handle) {
            Obj::Function(f) => f,
            other => panic!("expected function, got {other:?}"),
        };
        let position = outer
            .chunk
            .code
            .iter()
            .position(|&b| b == Opcode::MakeClosure as u8)
            .expect("inner closure emitted");
        assert_eq!(outer.chunk.code[position + 3], 1); // is_local
        assert_eq!(outer.chunk.code[position + 4], 1); // slot of `i`
        // Outer itself captured nothing.
        let make_closure = code
            .iter()
            .position(|&b| b == Opcode::MakeClosure as u8)
            .unwrap();
        assert_eq!(
            code[make_closure + 3],
            Opcode::DefineGlobal as u8,
            "no upvalue pairs for the outer function"
        );
        Ok(())
    }

    #[test]
    fn test_if_pops_condition_on_both_paths() -> Result<()> {
        let mut vm = Vm::new();
        let script = compile_source(&mut vm, "if (true) 1; else 2;")?;
        let code = script_code(&vm, script);
        let jump_if_false = code
            .iter()
            .position(|&b| b == Opcode::JumpIfFalse as u8)
            .unwrap();
        // POP right after the branch on the taken path.
        assert_eq!(code[jump_if_false + 3], Opcode::Pop as u8);
        let jump = code.iter().position(|&b| b == Opcode::Jump as u8).unwrap();
        assert_eq!(code[jump + 3], Opcode::Pop as u8);
        Ok(())
    }

    #[test]
    fn test_method_constructor_returns_receiver() -> Result<()> {
        let mut vm = Vm::new();
        let script =
            compile_source(&mut vm, "class P { constructor(x) { this.x = x; } }")?;
        let constants = match vm.heap.get(script) {
            Obj::Function(f) => f.chunk.constants.clone(),
            other => panic!("expected function, got {other:?}"),
        };
        let ctor = constants
            .iter()
            .filter_map(|c| c.as_obj())
            .find_map(|h| match vm.heap.get(h) {
                Obj::Function(f) if f.name == "constructor" => Some(f),
                _ => None,
            })
            .expect("constructor function in constant pool");
        let code = &ctor.chunk.code;
        let len = code.len();
        assert_eq!(code[len - 1], Opcode::Return as u8);
        assert_eq!(code[len - 3], Opcode::GetLocal as u8);
        assert_eq!(code[len - 2], 0);
        Ok(())
    }

    #[test]
    fn test_global_get_set_use_name_constants() -> Result<()> {
        let mut vm = Vm::new();
        let script = compile_source(&mut vm, "var g = 1; g = g + 1;")?;
        let code = script_code(&vm, script);
        assert!(code.contains(&(Opcode::DefineGlobal as u8)));
        assert!(code.contains(&(Opcode::GetGlobal as u8)));
        assert!(code.contains(&(Opcode::SetGlobal as u8)));
        Ok(())
    }

    #[test]
    fn test_import_emits_require_then_property_binds() -> Result<()> {
        let mut vm = Vm::new();
        let script =
            compile_source(&mut vm, "import { add } from \"util.js\";")?;
        let code = script_code(&vm, script);
        assert!(code.contains(&(Opcode::Call as u8)));
        assert!(code.contains(&(Opcode::GetProperty as u8)));
        assert!(code.contains(&(Opcode::DefineGlobal as u8)));
        Ok(())
    }
}
