use crate::compiler::Compiler;
use crate::event_loop::TimerQueue;
use crate::heap::Heap;
use crate::jit::JitCompiler;
use crate::native::{self, HandleRegistry};
use crate::object::{
    BoundMethod, Class, Closure, Instance, JitState, MethodRef, Native, NativeFn,
    Obj, Opcode, Upvalue,
};
use crate::parser::Parser;
use crate::scanner::Scanner;
use crate::value::{format_number, Value};
use anyhow::{anyhow, bail, Context, Result};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::fs;
use std::io::{self, Write};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

const STACK_RESERVE: usize = 2048;
const MAX_FRAMES: usize = 1024;
const MAX_JIT_ARGS: usize = 256;
const EVENT_LOOP_WAIT: Duration = Duration::from_millis(100);

/// Execution record for one call: the running closure, its function, the
/// instruction pointer, and the stack index of slot 0 (the receiver slot).
#[derive(Debug, Clone, Copy)]
pub struct CallFrame {
    pub closure: u32,
    pub function: u32,
    pub ip: usize,
    pub slots: usize,
}

/// The virtual machine: operand stack, call frames, globals, GC-owned heap,
/// timers, and the optional JIT. All interpreter state lives here so tests
/// can run independent VMs side by side.
pub struct Vm {
    pub stack: Vec<Value>,
    pub frames: Vec<CallFrame>,
    pub globals: HashMap<String, Value>,
    pub global_consts: HashSet<String>,
    pub heap: Heap,
    gray: Vec<u32>,
    /// Open upvalue handles ordered by descending stack slot.
    pub open_upvalues: Vec<u32>,
    /// Protects in-progress objects from collection; see the compiler and
    /// the module loader.
    pub temp_roots: Vec<u32>,
    pub modules: HashMap<String, Value>,
    pub list_methods: BTreeMap<String, u32>,
    pub string_methods: BTreeMap<String, u32>,
    pub handles: HandleRegistry,
    pub timers: Arc<TimerQueue>,
    pub workers: Vec<JoinHandle<()>>,
    jit: Option<JitCompiler>,
    jit_enabled: bool,
    /// When set, program output accumulates here instead of stdout.
    pub capture: Option<String>,
}

impl Default for Vm {
    fn default() -> Self {
        Self::new()
    }
}

impl Vm {
    pub fn new() -> Self {
        Self {
            stack: Vec::with_capacity(STACK_RESERVE),
            frames: Vec::new(),
            globals: HashMap::new(),
            global_consts: HashSet::new(),
            heap: Heap::new(),
            gray: Vec::new(),
            open_upvalues: Vec::new(),
            temp_roots: Vec::new(),
            modules: HashMap::new(),
            list_methods: BTreeMap::new(),
            string_methods: BTreeMap::new(),
            handles: HandleRegistry::new(),
            timers: Arc::new(TimerQueue::new()),
            workers: Vec::new(),
            jit: None,
            jit_enabled: false,
            capture: None,
        }
    }

    pub fn register_natives(&mut self) {
        native::register_all(self);
    }

    pub fn enable_jit(&mut self, enable: bool) {
        if enable && self.jit.is_none() {
            self.jit = JitCompiler::new();
        }
        self.jit_enabled = enable && self.jit.is_some();
    }

    // ---- output ---------------------------------------------------------

    pub fn write_out(&mut self, text: &str) {
        match &mut self.capture {
            Some(buffer) => buffer.push_str(text),
            None => {
                print!("{text}");
                let _ = io::stdout().flush();
            }
        }
    }

    // ---- allocation and garbage collection ------------------------------

    /// Runs a collection when the byte budget is exhausted. Callers that
    /// build multi-object structures call this once up front and then use
    /// `heap.alloc` directly, so no collection can fire while a structure is
    /// only partially linked.
    pub fn maybe_collect(&mut self) {
        if self.heap.should_collect() {
            self.collect_garbage();
        }
    }

    pub fn allocate(&mut self, obj: Obj) -> u32 {
        self.maybe_collect();
        self.heap.alloc(obj)
    }

    pub fn collect_garbage(&mut self) {
        self.mark_roots();
        self.trace_references();
        self.heap.sweep(&mut self.handles);
    }

    fn mark_roots(&mut self) {
        for index in 0..self.stack.len() {
            self.mark_value(self.stack[index]);
        }
        let global_values: Vec<Value> = self.globals.values().copied().collect();
        for value in global_values {
            self.mark_value(value);
        }
        let module_values: Vec<Value> = self.modules.values().copied().collect();
        for value in module_values {
            self.mark_value(value);
        }
        let frame_closures: Vec<u32> =
            self.frames.iter().map(|f| f.closure).collect();
        for closure in frame_closures {
            self.mark_object(closure);
        }
        let open: Vec<u32> = self.open_upvalues.clone();
        for upvalue in open {
            self.mark_object(upvalue);
        }
        let temps: Vec<u32> = self.temp_roots.clone();
        for handle in temps {
            self.mark_object(handle);
        }
        let methods: Vec<u32> = self
            .list_methods
            .values()
            .chain(self.string_methods.values())
            .copied()
            .collect();
        for handle in methods {
            self.mark_object(handle);
        }
        for callback in self.timers.pending_callbacks() {
            self.mark_object(callback);
        }
    }

    fn mark_value(&mut self, value: Value) {
        if let Value::Obj(handle) = value {
            self.mark_object(handle);
        }
    }

    fn mark_object(&mut self, handle: u32) {
        if self.heap.mark(handle) {
            self.gray.push(handle);
        }
    }

    /// Tri-colour trace: gray objects have been marked but not yet had their
    /// referents visited.
    fn trace_references(&mut self) {
        while let Some(handle) = self.gray.pop() {
            let mut child_objects: Vec<u32> = Vec::new();
            let mut child_values: Vec<Value> = Vec::new();
            match self.heap.get(handle) {
                Obj::Class(class) => {
                    child_objects.extend(class.methods.values());
                    child_objects.extend(class.native_methods.values());
                }
                Obj::Instance(instance) => {
                    child_objects.push(instance.class);
                    child_values.extend(instance.fields.values());
                }
                Obj::BoundMethod(bound) => {
                    child_values.push(bound.receiver);
                    match bound.method {
                        MethodRef::Closure(h) | MethodRef::Native(h) => {
                            child_objects.push(h)
                        }
                    }
                }
                Obj::List(items) => child_values.extend(items),
                Obj::Closure(closure) => {
                    child_objects.push(closure.function);
                    child_objects.extend(&closure.upvalues);
                }
                Obj::Function(function) => {
                    child_values.extend(&function.chunk.constants)
                }
                Obj::Upvalue(Upvalue::Closed(value)) => child_values.push(*value),
                Obj::Upvalue(Upvalue::Open(_)) | Obj::String(_) | Obj::Native(_) => {}
            }
            for value in child_values {
                self.mark_value(value);
            }
            for child in child_objects {
                self.mark_object(child);
            }
        }
    }

    // ---- strings and display --------------------------------------------

    pub fn new_string(&mut self, text: &str) -> Value {
        Value::Obj(self.allocate(Obj::String(text.to_string())))
    }

    pub fn get_string_value(&self, value: Value) -> Option<String> {
        match value.as_obj().map(|h| self.heap.get(h)) {
            Some(Obj::String(s)) => Some(s.clone()),
            _ => None,
        }
    }

    pub fn value_to_string(&self, value: Value) -> String {
        match value {
            Value::Null => "null".to_string(),
            Value::Bool(b) => b.to_string(),
            Value::Number(n) => format_number(n),
            Value::Obj(handle) => match self.heap.get(handle) {
                Obj::String(s) => s.clone(),
                Obj::Function(f) => format!("<fn {}>", f.name),
                Obj::Closure(c) => match self.heap.get(c.function) {
                    Obj::Function(f) => format!("<fn {}>", f.name),
                    _ => "<fn>".to_string(),
                },
                Obj::Native(n) => format!("<native fn {}>", n.name),
                Obj::Upvalue(_) => "<upvalue>".to_string(),
                Obj::List(items) => {
                    let parts: Vec<String> = items
                        .iter()
                        .map(|item| self.value_to_string(*item))
                        .collect();
                    format!("[{}]", parts.join(", "))
                }
                Obj::Class(c) => format!("<class {}>", c.name),
                Obj::Instance(i) => match self.heap.get(i.class) {
                    Obj::Class(c) => format!("<instance {}>", c.name),
                    _ => "<instance>".to_string(),
                },
                Obj::BoundMethod(b) => match b.method {
                    MethodRef::Closure(h) => match self.heap.get(h) {
                        Obj::Closure(c) => match self.heap.get(c.function) {
                            Obj::Function(f) => format!("<fn {}>", f.name),
                            _ => "<bound method>".to_string(),
                        },
                        _ => "<bound method>".to_string(),
                    },
                    MethodRef::Native(h) => match self.heap.get(h) {
                        Obj::Native(n) => format!("<native fn {}>", n.name),
                        _ => "<bound method>".to_string(),
                    },
                },
            },
        }
    }

    // ---- native registration --------------------------------------------

    pub fn define_native(&mut self, name: &str, function: NativeFn) {
        let handle = self.allocate(Obj::Native(Native {
            name: name.to_string(),
            function,
        }));
        self.globals.insert(name.to_string(), Value::Obj(handle));
    }

    pub fn bind_list_method(&mut self, name: &str, function: NativeFn) {
        let handle = self.allocate(Obj::Native(Native {
            name: name.to_string(),
            function,
        }));
        self.list_methods.insert(name.to_string(), handle);
    }

    pub fn bind_string_method(&mut self, name: &str, function: NativeFn) {
        let handle = self.allocate(Obj::Native(Native {
            name: name.to_string(),
            function,
        }));
        self.string_methods.insert(name.to_string(), handle);
    }

    pub fn define_native_class(
        &mut self,
        class_name: &str,
        methods: &[(&str, NativeFn)],
    ) {
        let mut class = Class::new(class_name.to_string());
        class.is_native = true;
        let class_handle = self.allocate(Obj::Class(class));
        self.temp_roots.push(class_handle);
        for (name, function) in methods {
            let native = self.allocate(Obj::Native(Native {
                name: name.to_string(),
                function: *function,
            }));
            if let Obj::Class(class) = self.heap.get_mut(class_handle) {
                class.native_methods.insert(name.to_string(), native);
            }
        }
        self.temp_roots.pop();
        self.globals
            .insert(class_name.to_string(), Value::Obj(class_handle));
    }

    // ---- stack helpers ---------------------------------------------------

    fn push(&mut self, value: Value) {
        self.stack.push(value);
    }

    fn pop(&mut self) -> Result<Value> {
        self.stack.pop().ok_or_else(|| anyhow!("stack underflow"))
    }

    fn peek(&self, distance: usize) -> Value {
        self.stack[self.stack.len() - 1 - distance]
    }

    // ---- upvalues --------------------------------------------------------

    /// Finds or creates the open upvalue for a stack slot, keeping the list
    /// ordered by descending slot.
    fn capture_upvalue(&mut self, slot: usize) -> u32 {
        let mut insert_at = self.open_upvalues.len();
        for (index, &handle) in self.open_upvalues.iter().enumerate() {
            if let Obj::Upvalue(Upvalue::Open(location)) = self.heap.get(handle) {
                if *location == slot {
                    return handle;
                }
                if *location < slot {
                    insert_at = index;
                    break;
                }
            }
        }
        let handle = self.allocate(Obj::Upvalue(Upvalue::Open(slot)));
        self.open_upvalues.insert(insert_at, handle);
        handle
    }

    /// Closes every open upvalue at or above `from_slot`: the value moves
    /// off the stack into the upvalue before the slot dies.
    fn close_upvalues(&mut self, from_slot: usize) {
        while let Some(&handle) = self.open_upvalues.first() {
            let location = match self.heap.get(handle) {
                Obj::Upvalue(Upvalue::Open(location)) => *location,
                _ => {
                    self.open_upvalues.remove(0);
                    continue;
                }
            };
            if location < from_slot {
                break;
            }
            let value = self.stack[location];
            *self.heap.get_mut(handle) = Obj::Upvalue(Upvalue::Closed(value));
            self.open_upvalues.remove(0);
        }
    }

    fn upvalue_get(&self, handle: u32) -> Value {
        match self.heap.get(handle) {
            Obj::Upvalue(Upvalue::Open(slot)) => self.stack[*slot],
            Obj::Upvalue(Upvalue::Closed(value)) => *value,
            _ => Value::Null,
        }
    }

    fn upvalue_set(&mut self, handle: u32, value: Value) {
        let open_slot = match self.heap.get(handle) {
            Obj::Upvalue(Upvalue::Open(slot)) => Some(*slot),
            Obj::Upvalue(Upvalue::Closed(_)) => None,
            _ => return,
        };
        match open_slot {
            Some(slot) => self.stack[slot] = value,
            None => {
                *self.heap.get_mut(handle) = Obj::Upvalue(Upvalue::Closed(value));
            }
        }
    }

    // ---- bytecode reading ------------------------------------------------

    fn read_byte(&mut self) -> Result<u8> {
        let frame = self
            .frames
            .last_mut()
            .ok_or_else(|| anyhow!("no active call frame"))?;
        let Obj::Function(function) = self.heap.get(frame.function) else {
            bail!("call frame does not reference a function");
        };
        let Some(&byte) = function.chunk.code.get(frame.ip) else {
            bail!("instruction pointer out of range");
        };
        frame.ip += 1;
        Ok(byte)
    }

    fn read_u16(&mut self) -> Result<u16> {
        let high = self.read_byte()?;
        let low = self.read_byte()?;
        Ok(u16::from_be_bytes([high, low]))
    }

    fn read_constant(&mut self) -> Result<Value> {
        let index = self.read_u16()? as usize;
        let frame = self
            .frames
            .last()
            .ok_or_else(|| anyhow!("no active call frame"))?;
        match self.heap.get(frame.function) {
            Obj::Function(function) => function
                .chunk
                .constants
                .get(index)
                .copied()
                .ok_or_else(|| anyhow!("constant index out of range")),
            _ => bail!("call frame does not reference a function"),
        }
    }

    fn read_name(&mut self) -> Result<String> {
        let value = self.read_constant()?;
        self.get_string_value(value)
            .ok_or_else(|| anyhow!("Variable name must be a string."))
    }

    // ---- equality --------------------------------------------------------

    /// Deep value equality: mixed tags are never equal, strings compare by
    /// contents, other references by identity. `==` and `===` share these
    /// rules; `!==` is the exact negation.
    pub fn values_equal(&self, a: Value, b: Value) -> bool {
        match (a, b) {
            (Value::Null, Value::Null) => true,
            (Value::Bool(x), Value::Bool(y)) => x == y,
            (Value::Number(x), Value::Number(y)) => x == y,
            (Value::Obj(x), Value::Obj(y)) => {
                match (self.heap.get(x), self.heap.get(y)) {
                    (Obj::String(s1), Obj::String(s2)) => s1 == s2,
                    _ => x == y,
                }
            }
            _ => false,
        }
    }

    // ---- execution entry points -----------------------------------------

    /// Compiles `source` through the scanner, parser, and compiler. The
    /// returned function handle is not yet rooted; callers protect it before
    /// the next allocation.
    pub fn compile_source(&mut self, source: &str, filename: &str) -> Result<u32> {
        let tokens = Scanner::new(source).scan_tokens();
        let statements = Parser::new(&tokens, filename).parse()?;
        Compiler::new(self).compile(&statements)
    }

    /// Executes a compiled script on a fresh stack. Runtime errors surface
    /// as the returned error after both stacks are cleared.
    pub fn interpret(&mut self, script: u32) -> Result<()> {
        self.stack.clear();
        self.frames.clear();
        self.open_upvalues.clear();

        // Root the script before anything here can trigger a collection.
        self.temp_roots.push(script);
        self.ensure_exports_object();
        let closure = self.allocate(Obj::Closure(Closure {
            function: script,
            upvalues: Vec::new(),
        }));
        self.temp_roots.pop();

        self.push(Value::Obj(closure));
        self.frames.push(CallFrame {
            closure,
            function: script,
            ip: 0,
            slots: 0,
        });
        let result = self.run();
        if result.is_err() {
            self.clear_run_state();
        }
        result
    }

    fn clear_run_state(&mut self) {
        self.stack.clear();
        self.frames.clear();
        self.open_upvalues.clear();
    }

    /// Re-entrant execution of a zero-state closure call: used by `require`
    /// and the event loop. Returns the closure's result value.
    pub fn call_and_run(&mut self, closure: u32) -> Result<Value> {
        let (function, arity) = match self.heap.get(closure) {
            Obj::Closure(c) => match self.heap.get(c.function) {
                Obj::Function(f) => (c.function, f.arity),
                _ => bail!("closure does not reference a function"),
            },
            _ => bail!("can only run closures"),
        };
        self.push(Value::Obj(closure));
        let slots = self.stack.len() - 1;
        // Missing arguments read as null.
        for _ in 0..arity {
            self.push(Value::Null);
        }
        self.frames.push(CallFrame {
            closure,
            function,
            ip: 0,
            slots,
        });
        self.run()?;
        self.pop()
    }

    /// The `export` statement writes into the global `exports` instance;
    /// top-level runs get a fresh one if none is installed yet.
    fn ensure_exports_object(&mut self) {
        if self.globals.contains_key("exports") {
            return;
        }
        self.maybe_collect();
        let exports_class = self
            .heap
            .alloc(Obj::Class(Class::new("exports".to_string())));
        let exports = self
            .heap
            .alloc(Obj::Instance(Instance::new(exports_class)));
        self.globals
            .insert("exports".to_string(), Value::Obj(exports));
    }

    /// Reads the entry file, runs the script, and then services timers until
    /// the event loop drains.
    pub fn run_with_file(&mut self, filename: &str) -> Result<()> {
        let source = fs::read_to_string(filename)
            .with_context(|| format!("Could not read file: {filename}"))?;

        let script = self.compile_source(&source, filename)?;
        if let Err(error) = self.interpret(script) {
            eprintln!("Runtime Error: {error}");
        }
        self.run_event_loop();
        Ok(())
    }

    /// Services queued timer tasks until the queue is empty, no interval
    /// remains registered, and every worker has finished. The stacks are
    /// cleared around each task so callbacks always start clean.
    pub fn run_event_loop(&mut self) {
        loop {
            self.workers.retain(|worker| !worker.is_finished());
            if self.timers.is_empty()
                && !self.timers.has_active_intervals()
                && self.workers.is_empty()
            {
                break;
            }

            self.timers.wait_for_ready(EVENT_LOOP_WAIT);

            while let Some(task) = self.timers.pop() {
                self.clear_run_state();
                let result = self.call_and_run(task.callback);
                self.clear_run_state();
                if let Err(error) = result {
                    eprintln!("Runtime Error: {error}");
                    if task.is_interval {
                        self.timers.clear_interval(task.interval_id);
                    }
                }
            }
        }
    }

    // ---- calls -----------------------------------------------------------

    fn call_value(&mut self, argc: usize, new_expression: bool) -> Result<()> {
        let callee_slot = self.stack.len() - 1 - argc;
        let callee = self.stack[callee_slot];
        let Some(handle) = callee.as_obj() else {
            if new_expression {
                bail!("Can only use 'new' with a class.");
            }
            bail!(
                "Can only call functions and classes, got {}.",
                self.value_to_string(callee)
            );
        };
        enum Kind {
            Closure,
            Native(NativeFn),
            Class,
            Bound(Value, MethodRef),
        }
        let kind = match self.heap.get(handle) {
            Obj::Closure(_) => Kind::Closure,
            Obj::Native(n) => Kind::Native(n.function),
            Obj::Class(_) => Kind::Class,
            Obj::BoundMethod(b) => Kind::Bound(b.receiver, b.method),
            other => bail!("Cannot call a {}.", other.type_name()),
        };
        if new_expression && !matches!(kind, Kind::Class) {
            bail!("Can only use 'new' with a class.");
        }
        match kind {
            Kind::Closure => self.call_closure(handle, argc, callee_slot),
            Kind::Native(function) => {
                self.call_native(function, callee_slot, argc)
            }
            Kind::Class => self.instantiate_class(handle, argc, callee_slot),
            Kind::Bound(receiver, method) => {
                self.stack[callee_slot] = receiver;
                match method {
                    MethodRef::Closure(closure) => {
                        self.call_closure(closure, argc, callee_slot)
                    }
                    MethodRef::Native(native) => {
                        let function = match self.heap.get(native) {
                            Obj::Native(n) => n.function,
                            _ => bail!("bound method target is not callable"),
                        };
                        self.call_native(function, callee_slot, argc)
                    }
                }
            }
        }
    }

    /// Pushes a frame for a closure call, or enters the function's JIT
    /// specialisation when one exists and every argument is numeric. The
    /// first call submits the chunk; an unsupported chunk is never
    /// resubmitted.
    fn call_closure(
        &mut self,
        closure: u32,
        argc: usize,
        callee_slot: usize,
    ) -> Result<()> {
        let function = match self.heap.get(closure) {
            Obj::Closure(c) => c.function,
            _ => bail!("callee is not a closure"),
        };
        let (arity, jit_state) = match self.heap.get(function) {
            Obj::Function(f) => (f.arity, f.jit),
            _ => bail!("closure does not reference a function"),
        };
        if argc != arity {
            bail!("Expected {arity} arguments but got {argc}.");
        }
        if self.frames.len() >= MAX_FRAMES {
            bail!("Stack overflow.");
        }

        if self.jit_enabled {
            let state = match jit_state {
                JitState::Untried => {
                    let chunk = match self.heap.get(function) {
                        Obj::Function(f) => f.chunk.clone(),
                        _ => bail!("closure does not reference a function"),
                    };
                    let compiled =
                        self.jit.as_mut().and_then(|jit| jit.compile(&chunk));
                    let state = match compiled {
                        Some(entry) => JitState::Compiled(entry),
                        None => JitState::Unsupported,
                    };
                    if let Obj::Function(f) = self.heap.get_mut(function) {
                        f.jit = state;
                    }
                    state
                }
                other => other,
            };
            if let JitState::Compiled(entry) = state {
                if argc <= MAX_JIT_ARGS {
                    let mut packed = [0.0f64; MAX_JIT_ARGS];
                    let mut all_numeric = true;
                    for i in 0..argc {
                        match self.stack[callee_slot + 1 + i] {
                            Value::Number(n) => packed[i] = n,
                            _ => {
                                all_numeric = false;
                                break;
                            }
                        }
                    }
                    if all_numeric {
                        let result = unsafe { entry(packed.as_ptr()) };
                        self.stack.truncate(callee_slot);
                        self.push(Value::Number(result));
                        return Ok(());
                    }
                }
            }
        }

        self.frames.push(CallFrame {
            closure,
            function,
            ip: 0,
            slots: callee_slot,
        });
        Ok(())
    }

    /// Invokes a host function while its arguments are still live on the
    /// stack, then replaces callee and arguments with the result. The value
    /// at the callee slot is the receiver.
    fn call_native(
        &mut self,
        function: NativeFn,
        callee_slot: usize,
        argc: usize,
    ) -> Result<()> {
        let receiver = self.stack[callee_slot];
        let args: Vec<Value> =
            self.stack[callee_slot + 1..callee_slot + 1 + argc].to_vec();
        let result = function(self, receiver, &args)?;
        self.stack.truncate(callee_slot);
        self.push(result);
        Ok(())
    }

    fn instantiate_class(
        &mut self,
        class: u32,
        argc: usize,
        callee_slot: usize,
    ) -> Result<()> {
        let (native_ctor, script_ctor) = match self.heap.get(class) {
            Obj::Class(c) => (
                c.native_methods.get("constructor").copied(),
                c.methods.get("constructor").copied(),
            ),
            _ => bail!("callee is not a class"),
        };
        let instance = self.allocate(Obj::Instance(Instance::new(class)));
        self.stack[callee_slot] = Value::Obj(instance);

        if let Some(ctor) = native_ctor {
            let function = match self.heap.get(ctor) {
                Obj::Native(n) => n.function,
                _ => bail!("native constructor is not callable"),
            };
            let args: Vec<Value> =
                self.stack[callee_slot + 1..callee_slot + 1 + argc].to_vec();
            function(self, Value::Obj(instance), &args)?;
            self.stack.truncate(callee_slot);
            self.push(Value::Obj(instance));
        } else if let Some(ctor) = script_ctor {
            self.call_closure(ctor, argc, callee_slot)?;
        } else if argc != 0 {
            bail!("Expected 0 arguments but got {argc}.");
        }
        Ok(())
    }

    fn bind_method(&mut self, receiver: Value, method: MethodRef) -> Value {
        let handle = self.allocate(Obj::BoundMethod(BoundMethod {
            receiver,
            method,
        }));
        Value::Obj(handle)
    }

    // ---- property access -------------------------------------------------

    fn get_property(&mut self, name: &str) -> Result<()> {
        enum Found {
            Plain(Value),
            Bind(MethodRef),
        }

        let target = self.peek(0);
        if target == Value::Null {
            bail!("Cannot read property '{name}' of null");
        }
        let Some(handle) = target.as_obj() else {
            bail!("Only instances, classes, lists, or strings have properties.");
        };

        let found = match self.heap.get(handle) {
            Obj::List(items) => {
                if name == "length" {
                    Found::Plain(Value::Number(items.len() as f64))
                } else if let Some(&method) = self.list_methods.get(name) {
                    Found::Bind(MethodRef::Native(method))
                } else {
                    bail!("Undefined property '{name}' on list.");
                }
            }
            Obj::String(s) => {
                if name == "length" {
                    Found::Plain(Value::Number(s.chars().count() as f64))
                } else if let Some(&method) = self.string_methods.get(name) {
                    Found::Bind(MethodRef::Native(method))
                } else {
                    bail!("Undefined property '{name}' on string.");
                }
            }
            Obj::Instance(instance) => {
                if let Some(&field) = instance.fields.get(name) {
                    Found::Plain(field)
                } else {
                    match self.heap.get(instance.class) {
                        Obj::Class(c) => {
                            if let Some(&method) = c.native_methods.get(name) {
                                Found::Bind(MethodRef::Native(method))
                            } else if let Some(&method) = c.methods.get(name) {
                                Found::Bind(MethodRef::Closure(method))
                            } else {
                                bail!("Undefined property '{name}'.");
                            }
                        }
                        _ => bail!("Undefined property '{name}'."),
                    }
                }
            }
            // Static access: ClassName.method().
            Obj::Class(class) => {
                if let Some(&method) = class.native_methods.get(name) {
                    Found::Bind(MethodRef::Native(method))
                } else if let Some(&method) = class.methods.get(name) {
                    Found::Bind(MethodRef::Closure(method))
                } else {
                    bail!("Undefined property '{name}' on class.");
                }
            }
            _ => bail!("Only instances, classes, lists, or strings have properties."),
        };

        let value = match found {
            Found::Plain(value) => value,
            // The receiver stays on the stack while the bound method is
            // allocated, keeping it rooted across a collection.
            Found::Bind(method) => self.bind_method(target, method),
        };
        self.pop()?;
        self.push(value);
        Ok(())
    }

    // ---- the dispatch loop ----------------------------------------------

    /// Executes until the frame stack shrinks below its depth at entry.
    /// Natives and the event loop re-enter here; the depth sentinel returns
    /// control to each caller when its frame finishes.
    pub fn run(&mut self) -> Result<()> {
        let start_depth = self.frames.len();

        loop {
            let byte = self.read_byte()?;
            let Some(op) = Opcode::from_byte(byte) else {
                bail!("unknown opcode {byte}");
            };
            match op {
                Opcode::Constant => {
                    let value = self.read_constant()?;
                    self.push(value);
                }
                Opcode::Nil => self.push(Value::Null),
                Opcode::True => self.push(Value::Bool(true)),
                Opcode::False => self.push(Value::Bool(false)),
                Opcode::Pop => {
                    self.pop()?;
                }
                Opcode::GetLocal => {
                    let slot = self.read_byte()? as usize;
                    let base = self.frames.last().map(|f| f.slots).unwrap_or(0);
                    self.push(self.stack[base + slot]);
                }
                Opcode::SetLocal => {
                    let slot = self.read_byte()? as usize;
                    let base = self.frames.last().map(|f| f.slots).unwrap_or(0);
                    let value = self.peek(0);
                    self.stack[base + slot] = value;
                }
                Opcode::GetGlobal => {
                    let name = self.read_name()?;
                    let value =
                        self.globals.get(&name).copied().unwrap_or(Value::Null);
                    self.push(value);
                }
                Opcode::DefineGlobal => {
                    let name = self.read_name()?;
                    let value = self.pop()?;
                    self.globals.insert(name, value);
                }
                Opcode::DefineGlobalConst => {
                    let name = self.read_name()?;
                    let value = self.pop()?;
                    self.globals.insert(name.clone(), value);
                    self.global_consts.insert(name);
                }
                Opcode::SetGlobal => {
                    let name = self.read_name()?;
                    if self.global_consts.contains(&name) {
                        bail!(
                            "Cannot assign to const global variable '{name}'."
                        );
                    }
                    if !self.globals.contains_key(&name) {
                        bail!("Undefined variable '{name}'.");
                    }
                    // Like SET_LOCAL, the assigned value stays on the stack
                    // as the value of the assignment expression.
                    let value = self.peek(0);
                    self.globals.insert(name, value);
                }
                Opcode::GetUpvalue => {
                    let index = self.read_byte()? as usize;
                    let handle = match self.heap.get(self.frames.last().unwrap().closure)
                    {
                        Obj::Closure(c) => c.upvalues[index],
                        _ => bail!("frame closure missing"),
                    };
                    let value = self.upvalue_get(handle);
                    self.push(value);
                }
                Opcode::SetUpvalue => {
                    let index = self.read_byte()? as usize;
                    let handle = match self.heap.get(self.frames.last().unwrap().closure)
                    {
                        Obj::Closure(c) => c.upvalues[index],
                        _ => bail!("frame closure missing"),
                    };
                    let value = self.peek(0);
                    self.upvalue_set(handle, value);
                }
                Opcode::Equal | Opcode::StrictEqual => {
                    let b = self.pop()?;
                    let a = self.pop()?;
                    let equal = self.values_equal(a, b);
                    self.push(Value::Bool(equal));
                }
                Opcode::StrictNotEqual => {
                    let b = self.pop()?;
                    let a = self.pop()?;
                    let equal = self.values_equal(a, b);
                    self.push(Value::Bool(!equal));
                }
                Opcode::Greater | Opcode::Less => {
                    let b = self.pop()?;
                    let a = self.pop()?;
                    let (Value::Number(a), Value::Number(b)) = (a, b) else {
                        bail!("Operands must be numbers for comparison.");
                    };
                    let result = if op == Opcode::Greater { a > b } else { a < b };
                    self.push(Value::Bool(result));
                }
                Opcode::Add => self.add_values()?,
                Opcode::Sub | Opcode::Mul | Opcode::Div | Opcode::Mod => {
                    let b = self.pop()?;
                    let a = self.pop()?;
                    let (Value::Number(a), Value::Number(b)) = (a, b) else {
                        bail!("Operands must be numbers.");
                    };
                    let result = match op {
                        Opcode::Sub => a - b,
                        Opcode::Mul => a * b,
                        Opcode::Div => a / b,
                        _ => a % b,
                    };
                    self.push(Value::Number(result));
                }
                Opcode::Not => {
                    let value = self.pop()?;
                    self.push(Value::Bool(!value.is_truthy()));
                }
                Opcode::Negate => {
                    let value = self.pop()?;
                    let Value::Number(n) = value else {
                        bail!("Operand must be a number.");
                    };
                    self.push(Value::Number(-n));
                }
                Opcode::Jump => {
                    let offset = self.read_u16()? as usize;
                    self.frames.last_mut().unwrap().ip += offset;
                }
                Opcode::JumpIfFalse => {
                    let offset = self.read_u16()? as usize;
                    if !self.peek(0).is_truthy() {
                        self.frames.last_mut().unwrap().ip += offset;
                    }
                }
                Opcode::JumpIfTrue => {
                    let offset = self.read_u16()? as usize;
                    if self.peek(0).is_truthy() {
                        self.frames.last_mut().unwrap().ip += offset;
                    }
                }
                Opcode::Loop => {
                    let offset = self.read_u16()? as usize;
                    self.frames.last_mut().unwrap().ip -= offset;
                }
                Opcode::Call => {
                    let argc = self.read_byte()? as usize;
                    self.call_value(argc, false)?;
                }
                Opcode::New => {
                    let argc = self.read_byte()? as usize;
                    self.call_value(argc, true)?;
                }
                Opcode::MakeClosure => {
                    let function = self
                        .read_constant()?
                        .as_obj()
                        .ok_or_else(|| anyhow!("Expected function constant."))?;
                    let upvalue_count = match self.heap.get(function) {
                        Obj::Function(f) => f.upvalue_count,
                        _ => bail!("Expected function constant."),
                    };
                    let closure = self.allocate(Obj::Closure(Closure {
                        function,
                        upvalues: Vec::with_capacity(upvalue_count),
                    }));
                    self.push(Value::Obj(closure));
                    for _ in 0..upvalue_count {
                        let is_local = self.read_byte()? == 1;
                        let index = self.read_byte()? as usize;
                        let upvalue = if is_local {
                            let base = self.frames.last().unwrap().slots;
                            self.capture_upvalue(base + index)
                        } else {
                            match self
                                .heap
                                .get(self.frames.last().unwrap().closure)
                            {
                                Obj::Closure(c) => c.upvalues[index],
                                _ => bail!("frame closure missing"),
                            }
                        };
                        if let Obj::Closure(c) = self.heap.get_mut(closure) {
                            c.upvalues.push(upvalue);
                        }
                    }
                }
                Opcode::CloseUpvalue => {
                    self.close_upvalues(self.stack.len() - 1);
                    self.pop()?;
                }
                Opcode::Return => {
                    let result = self.pop()?;
                    let frame = self
                        .frames
                        .pop()
                        .ok_or_else(|| anyhow!("return without a frame"))?;
                    self.close_upvalues(frame.slots);
                    self.stack.truncate(frame.slots);
                    self.push(result);
                    if self.frames.len() < start_depth {
                        return Ok(());
                    }
                }
                Opcode::BuildList => {
                    let count = self.read_byte()? as usize;
                    self.maybe_collect();
                    let elements = self.stack.split_off(self.stack.len() - count);
                    let handle = self.heap.alloc(Obj::List(elements));
                    self.push(Value::Obj(handle));
                }
                Opcode::BuildObject => {
                    let count = self.read_byte()? as usize;
                    self.maybe_collect();
                    let class = self
                        .heap
                        .alloc(Obj::Class(Class::new("<object>".to_string())));
                    let instance =
                        self.heap.alloc(Obj::Instance(Instance::new(class)));
                    for _ in 0..count {
                        let value = self.pop()?;
                        let key = self.pop()?;
                        let Some(key) = self.get_string_value(key) else {
                            bail!("Object property key must be a string.");
                        };
                        if let Obj::Instance(i) = self.heap.get_mut(instance) {
                            i.fields.insert(key, value);
                        }
                    }
                    self.push(Value::Obj(instance));
                }
                Opcode::GetSubscript => {
                    let index = self.pop()?;
                    let target = self.pop()?;
                    let value = self.subscript_get(target, index)?;
                    self.push(value);
                }
                Opcode::SetSubscript => {
                    let value = self.pop()?;
                    let index = self.pop()?;
                    let target = self.pop()?;
                    self.subscript_set(target, index, value)?;
                    self.push(value);
                }
                Opcode::Class => {
                    let name = self.read_name()?;
                    let handle = self.allocate(Obj::Class(Class::new(name)));
                    self.push(Value::Obj(handle));
                }
                Opcode::Method => {
                    let name = self.read_name()?;
                    let method = self.pop()?;
                    let Some(method) = method.as_obj() else {
                        bail!("method must be a closure");
                    };
                    let class = self
                        .peek(0)
                        .as_obj()
                        .ok_or_else(|| anyhow!("no class on stack"))?;
                    match self.heap.get_mut(class) {
                        Obj::Class(c) => {
                            c.methods.insert(name, method);
                        }
                        _ => bail!("no class on stack"),
                    }
                }
                Opcode::GetProperty => {
                    let name = self.read_name()?;
                    self.get_property(&name)?;
                }
                Opcode::SetProperty => {
                    let name = self.read_name()?;
                    let value = self.pop()?;
                    let target = self.pop()?;
                    let Some(handle) = target.as_obj() else {
                        bail!("Only instances have fields.");
                    };
                    match self.heap.get_mut(handle) {
                        Obj::Instance(instance) => {
                            instance.fields.insert(name, value);
                        }
                        _ => bail!("Only instances have fields."),
                    }
                    self.push(value);
                }
            }
        }
    }

    /// `+` concatenates when either side is a string, adds when both sides
    /// are numbers, and errors otherwise. Operands stay on the stack until
    /// any result string is allocated, keeping them rooted across a possible
    /// collection.
    fn add_values(&mut self) -> Result<()> {
        let b = self.peek(0);
        let a = self.peek(1);
        let a_is_string =
            matches!(a.as_obj().map(|h| self.heap.get(h)), Some(Obj::String(_)));
        let b_is_string =
            matches!(b.as_obj().map(|h| self.heap.get(h)), Some(Obj::String(_)));

        if a_is_string || b_is_string {
            let text =
                format!("{}{}", self.value_to_string(a), self.value_to_string(b));
            let result = self.new_string(&text);
            self.pop()?;
            self.pop()?;
            self.push(result);
            return Ok(());
        }
        if let (Value::Number(x), Value::Number(y)) = (a, b) {
            self.pop()?;
            self.pop()?;
            self.push(Value::Number(x + y));
            return Ok(());
        }
        bail!("Operands must be two numbers or two strings.");
    }

    fn subscript_get(&self, target: Value, index: Value) -> Result<Value> {
        let Some(handle) = target.as_obj() else {
            bail!("Operand must be a list.");
        };
        let Obj::List(items) = self.heap.get(handle) else {
            bail!("Operand must be a list.");
        };
        let Value::Number(index) = index else {
            bail!("Index must be a number.");
        };
        let index = index as i64;
        if index < 0 || index as usize >= items.len() {
            bail!("List index out of bounds.");
        }
        Ok(items[index as usize])
    }

    fn subscript_set(
        &mut self,
        target: Value,
        index: Value,
        value: Value,
    ) -> Result<()> {
        let Some(handle) = target.as_obj() else {
            bail!("Operand must be a list.");
        };
        let Value::Number(index) = index else {
            bail!("Index must be a number.");
        };
        let index = index as i64;
        match self.heap.get_mut(handle) {
            Obj::List(items) => {
                if index < 0 || index as usize >= items.len() {
                    bail!("List index out of bounds.");
                }
                items[index as usize] = value;
                Ok(())
            }
            _ => bail!("Operand must be a list."),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::path::PathBuf;

    fn new_vm() -> Vm {
        let mut vm = Vm::new();
        vm.register_natives();
        vm.capture = Some(String::new());
        vm
    }

    fn run_source(vm: &mut Vm, source: &str) -> Result<String> {
        let script = vm.compile_source(source, "test")?;
        vm.interpret(script)?;
        Ok(vm.capture.clone().unwrap_or_default())
    }

    fn run_program(source: &str) -> Result<String> {
        let mut vm = new_vm();
        run_source(&mut vm, source)
    }

    fn temp_script(name: &str, contents: &str) -> PathBuf {
        let mut path = std::env::temp_dir();
        path.push(format!("sleet_{}_{}.js", std::process::id(), name));
        fs::write(&path, contents).unwrap();
        path
    }

    #[test]
    fn test_closures_and_upvalues() -> Result<()> {
        let output = run_program(
            "function mk(){ var i=0; return function(){ i = i+1; return i; }; } \
             var c = mk(); println(c()); println(c()); println(c());",
        )?;
        assert_eq!(output, "1\n2\n3\n");
        Ok(())
    }

    #[test]
    fn test_sibling_closures_share_one_cell() -> Result<()> {
        let output = run_program(
            "function pair(){ var n = 0; \
               var inc = function(){ n = n + 1; return n; }; \
               var get = function(){ return n; }; \
               return [inc, get]; } \
             var fns = pair(); var inc = fns[0]; var get = fns[1]; \
             inc(); inc(); println(get());",
        )?;
        assert_eq!(output, "2\n");
        Ok(())
    }

    #[test]
    fn test_recursion_and_arithmetic() -> Result<()> {
        let output = run_program(
            "function f(n){ if (n<2) return n; return f(n-1)+f(n-2); } println(f(10));",
        )?;
        assert_eq!(output, "55\n");
        Ok(())
    }

    #[test]
    fn test_classes_and_this() -> Result<()> {
        let output = run_program(
            "class P { constructor(x,y){ this.x=x; this.y=y; } sum(){ return this.x+this.y; } } \
             var p = new P(3,4); println(p.sum());",
        )?;
        assert_eq!(output, "7\n");
        Ok(())
    }

    #[test]
    fn test_calling_class_without_new_instantiates() -> Result<()> {
        let output = run_program(
            "class P { constructor(x,y){ this.x=x; this.y=y; } sum(){ return this.x+this.y; } } \
             var p = P(3,4); println(p.sum());",
        )?;
        assert_eq!(output, "7\n");
        Ok(())
    }

    #[test]
    fn test_lists_and_methods() -> Result<()> {
        let output = run_program(
            "var a=[1,2,3]; a.push(4); println(a.length); println(a.join(\"-\"));",
        )?;
        assert_eq!(output, "4\n1-2-3-4\n");
        Ok(())
    }

    #[test]
    fn test_strict_equality() -> Result<()> {
        let output = run_program(
            "println(1 == \"1\"); println(1 === \"1\"); println(\"a\"+\"b\" === \"ab\");",
        )?;
        assert_eq!(output, "false\nfalse\ntrue\n");
        Ok(())
    }

    #[test]
    fn test_loose_equality_mixed_tags_is_false() -> Result<()> {
        let output =
            run_program("println(1 == true); println(null == false); println(0 == \"\");")?;
        assert_eq!(output, "false\nfalse\nfalse\n");
        Ok(())
    }

    #[test]
    fn test_const_global_reassignment_is_runtime_error() {
        let error = run_program("const k = 1; k = 2;").unwrap_err();
        assert!(error.to_string().contains("k"), "{error}");
        assert!(error.to_string().contains("const"), "{error}");
    }

    #[test]
    fn test_for_loop_and_update_expressions() -> Result<()> {
        let output = run_program(
            "for (var i = 0; i < 3; i++) { print(i + \" \"); } println(\"\"); \
             var j = 5; println(j++); println(j); println(++j);",
        )?;
        assert_eq!(output, "0 1 2 \n5\n6\n7\n");
        Ok(())
    }

    #[test]
    fn test_ternary_and_short_circuit() -> Result<()> {
        let output = run_program(
            "println(2 > 1 ? \"yes\" : \"no\"); \
             println(false || 3); \
             println(null && 1); \
             println(true && \"right\");",
        )?;
        assert_eq!(output, "yes\n3\nnull\nright\n");
        Ok(())
    }

    #[test]
    fn test_compound_assignment_and_modulo() -> Result<()> {
        let output = run_program(
            "var x = 10; x += 5; x -= 3; x *= 2; x /= 4; println(x); println(10 % 3);",
        )?;
        assert_eq!(output, "6\n1\n");
        Ok(())
    }

    #[test]
    fn test_object_literals_and_statics() -> Result<()> {
        let output = run_program(
            "var o = { a: 1, 'b': 2 }; \
             println(o.a + o.b); \
             println(Object.keys(o).join(\",\")); \
             println(Object.values(o).join(\",\")); \
             var first = Object.entries(o)[0]; \
             println(first[0] + \"=\" + first[1]);",
        )?;
        assert_eq!(output, "3\na,b\n1,2\na=1\n");
        Ok(())
    }

    #[test]
    fn test_subscripts() -> Result<()> {
        let output = run_program(
            "var xs = [1, 2, 3]; xs[1] = 5; println(xs[1]); println(xs[0]); println(xs[2]);",
        )?;
        assert_eq!(output, "5\n1\n3\n");
        Ok(())
    }

    #[test]
    fn test_subscript_out_of_bounds_is_runtime_error() {
        let error = run_program("var xs = [1]; println(xs[3]);").unwrap_err();
        assert!(error.to_string().contains("out of bounds"), "{error}");
    }

    #[test]
    fn test_string_methods() -> Result<()> {
        let output = run_program(
            "var s = \"Hello\"; \
             println(s.length); \
             println(s.at(1)); \
             println(s.indexOf(\"llo\")); \
             println(s.substring(1, 4)); \
             println(s.toUpperCase()); \
             println(s.toLowerCase()); \
             println(\"  pad  \".trim());",
        )?;
        assert_eq!(output, "5\ne\n2\nell\nHELLO\nhello\npad\n");
        Ok(())
    }

    #[test]
    fn test_typeof() -> Result<()> {
        let output = run_program(
            "println(typeof(1)); println(typeof(\"s\")); println(typeof(true)); \
             println(typeof(null)); println(typeof([1])); println(typeof(println)); \
             function f(){ return 0; } println(typeof(f));",
        )?;
        assert_eq!(
            output,
            "number\nstring\nboolean\nobject\nobject\nfunction\nfunction\n"
        );
        Ok(())
    }

    #[test]
    fn test_bound_method_detached_from_receiver() -> Result<()> {
        let output = run_program(
            "class P { constructor(x,y){ this.x=x; this.y=y; } sum(){ return this.x+this.y; } } \
             var p = new P(3,4); var m = p.sum; println(m());",
        )?;
        assert_eq!(output, "7\n");
        Ok(())
    }

    #[test]
    fn test_property_of_null_is_runtime_error() {
        let error = run_program("var o = null; println(o.field);").unwrap_err();
        assert!(error.to_string().contains("null"), "{error}");
    }

    #[test]
    fn test_undefined_global_reads_null_and_set_errors() {
        let output = run_program("println(missing);").unwrap();
        assert_eq!(output, "null\n");

        let error = run_program("missing = 1;").unwrap_err();
        assert!(error.to_string().contains("Undefined variable"), "{error}");
    }

    #[test]
    fn test_closure_arity_mismatch_is_runtime_error() {
        let error =
            run_program("function f(a, b){ return a; } f(1);").unwrap_err();
        assert!(error.to_string().contains("Expected 2 arguments"), "{error}");
    }

    #[test]
    fn test_string_number_concatenation() -> Result<()> {
        let output =
            run_program("println(\"n=\" + 4); println(1 + \"x\"); println(2.5 + \"\");")?;
        assert_eq!(output, "n=4\n1x\n2.5\n");
        Ok(())
    }

    #[test]
    fn test_gc_survives_heavy_allocation() -> Result<()> {
        let mut vm = new_vm();
        // Force frequent collections.
        vm.heap.next_gc = 512;
        let output = run_source(
            &mut vm,
            "var keep = []; \
             var i = 0; \
             while (i < 500) { keep.push(\"item\" + i); i = i + 1; } \
             println(keep.length); println(keep[0]); println(keep[499]);",
        )?;
        assert_eq!(output, "500\nitem0\nitem499\n");
        Ok(())
    }

    #[test]
    fn test_gc_reclaims_cycles() -> Result<()> {
        let mut vm = new_vm();
        run_source(
            &mut vm,
            "class Node { } \
             function link() { \
                 var a = new Node(); var b = new Node(); \
                 a.next = b; b.next = a; \
             } \
             link(); println(\"linked\");",
        )?;
        let before = vm.heap.live_count();
        vm.clear_run_state();
        vm.collect_garbage();
        // The two mutually referencing instances are unreachable and must go.
        assert!(vm.heap.live_count() < before);
        Ok(())
    }

    #[test]
    fn test_gc_keeps_closed_upvalues_alive() -> Result<()> {
        let mut vm = new_vm();
        vm.heap.next_gc = 512;
        let output = run_source(
            &mut vm,
            "function counter() { var n = 0; return function() { n = n + 1; return n; }; } \
             var c = counter(); \
             var i = 0; \
             while (i < 200) { var junk = \"garbage\" + i; i = i + 1; } \
             c(); c(); println(c());",
        )?;
        assert_eq!(output, "3\n");
        Ok(())
    }

    #[test]
    fn test_stack_balance_after_script() -> Result<()> {
        let mut vm = new_vm();
        run_source(&mut vm, "var a = 1; { var b = 2; println(a + b); }")?;
        // The script's own result is the only value left behind.
        assert_eq!(vm.stack.len(), 1);
        assert!(vm.frames.is_empty());
        assert!(vm.open_upvalues.is_empty());
        Ok(())
    }

    #[test]
    fn test_require_memoises_exports() -> Result<()> {
        let module = temp_script(
            "module_a",
            "var calls = 0; calls = calls + 1; \
             var double = (x) => x * 2; \
             var tag = \"mod\"; \
             export { double, tag };",
        );
        let path = module.to_string_lossy().replace('\\', "/");
        let output = run_program(&format!(
            "var m1 = require(\"{path}\"); \
             var m2 = require(\"{path}\"); \
             println(m1.double(21)); \
             println(m1.tag); \
             println(m1 === m2);"
        ))?;
        assert_eq!(output, "42\nmod\ntrue\n");
        fs::remove_file(module).ok();
        Ok(())
    }

    #[test]
    fn test_require_missing_file_returns_null() -> Result<()> {
        let output =
            run_program("println(require(\"no/such/module.js\") == null);")?;
        assert_eq!(output, "true\n");
        Ok(())
    }

    #[test]
    fn test_import_binds_globals() -> Result<()> {
        let module = temp_script(
            "module_b",
            "function add(a, b) { return a + b; } var PI = 3.14; export { add, PI };",
        );
        let path = module.to_string_lossy().replace('\\', "/");
        let output = run_program(&format!(
            "import {{ add, PI }} from \"{path}\"; println(add(2, 3)); println(PI);"
        ))?;
        assert_eq!(output, "5\n3.14\n");
        fs::remove_file(module).ok();
        Ok(())
    }

    #[test]
    fn test_file_class_round_trip() -> Result<()> {
        let mut path = std::env::temp_dir();
        path.push(format!("sleet_file_{}.txt", std::process::id()));
        let path_text = path.to_string_lossy().replace('\\', "/");
        let output = run_program(&format!(
            "var f = new File(\"{path_text}\", \"w\"); \
             println(f.isOpen()); \
             f.write(\"hello file\"); \
             f.close(); \
             println(f.isOpen()); \
             var r = new File(\"{path_text}\"); \
             println(r.read()); \
             println(r.size()); \
             println(r.remove());"
        ))?;
        assert_eq!(output, "true\nfalse\nhello file\n10\ntrue\n");
        assert!(!path.exists());
        Ok(())
    }

    #[test]
    fn test_set_timeout_runs_after_script() -> Result<()> {
        let mut vm = new_vm();
        run_source(
            &mut vm,
            "println(\"first\"); \
             setTimeout(() => { println(\"timeout\"); }, 10); \
             println(\"second\");",
        )?;
        vm.run_event_loop();
        let output = vm.capture.clone().unwrap();
        assert_eq!(output, "first\nsecond\ntimeout\n");
        Ok(())
    }

    #[test]
    fn test_interval_stops_after_clear() -> Result<()> {
        let mut vm = new_vm();
        run_source(
            &mut vm,
            "var n = 0; \
             var id = setInterval(() => { \
                 n = n + 1; \
                 println(\"tick\" + n); \
                 if (n >= 3) { clearInterval(id); } \
             }, 5);",
        )?;
        vm.run_event_loop();
        let output = vm.capture.clone().unwrap();
        assert!(output.contains("tick1"), "{output}");
        assert!(output.contains("tick2"), "{output}");
        assert!(output.contains("tick3"), "{output}");
        assert!(!vm.timers.has_active_intervals());
        Ok(())
    }

    #[test]
    fn test_jit_numeric_path_and_fallback() -> Result<()> {
        let mut vm = new_vm();
        vm.enable_jit(true);
        let output = run_source(
            &mut vm,
            "function add(a, b) { return a + b; } \
             println(add(1, 2)); \
             println(add(20, 22)); \
             println(add(\"x\", \"y\"));",
        )?;
        assert_eq!(output, "3\n42\nxy\n");
        Ok(())
    }

    #[test]
    fn test_jit_disabled_matches_enabled() -> Result<()> {
        let program = "function mul(a, b) { return a * b; } println(mul(6, 7));";
        let plain = run_program(program)?;
        let mut vm = new_vm();
        vm.enable_jit(true);
        let jitted = run_source(&mut vm, program)?;
        assert_eq!(plain, jitted);
        assert_eq!(plain, "42\n");
        Ok(())
    }

    #[test]
    fn test_nested_blocks_close_upvalues() -> Result<()> {
        let output = run_program(
            "var fns = []; \
             { \
                 var captured = 10; \
                 fns.push(function() { return captured; }); \
             } \
             println(fns[0]());",
        )?;
        assert_eq!(output, "10\n");
        Ok(())
    }

    #[test]
    fn test_exports_object_restored_after_require() -> Result<()> {
        let module = temp_script("module_c", "var inner = 1; export { inner };");
        let path = module.to_string_lossy().replace('\\', "/");
        let output = run_program(&format!(
            "var outer = 2; export {{ outer }}; \
             require(\"{path}\"); \
             println(exports.outer);"
        ))?;
        assert_eq!(output, "2\n");
        fs::remove_file(module).ok();
        Ok(())
    }

    proptest! {
        #[test]
        fn prop_equality_reflexive_and_symmetric(
            a in value_strategy(),
            b in value_strategy()
        ) {
            let mut vm = Vm::new();
            let a = materialise(&mut vm, a);
            let b = materialise(&mut vm, b);
            prop_assert!(vm.values_equal(a, a));
            prop_assert!(vm.values_equal(b, b));
            prop_assert_eq!(vm.values_equal(a, b), vm.values_equal(b, a));
        }

        #[test]
        fn prop_integral_numbers_format_without_point(n in -1_000_000i64..1_000_000) {
            let text = format_number(n as f64);
            prop_assert_eq!(text.parse::<i64>().unwrap(), n);
        }
    }

    #[derive(Debug, Clone)]
    enum ProtoValue {
        Null,
        Bool(bool),
        Number(f64),
        Str(String),
    }

    fn value_strategy() -> impl Strategy<Value = ProtoValue> {
        prop_oneof![
            Just(ProtoValue::Null),
            any::<bool>().prop_map(ProtoValue::Bool),
            (-1000.0f64..1000.0).prop_map(ProtoValue::Number),
            "[a-z]{0,8}".prop_map(ProtoValue::Str),
        ]
    }

    fn materialise(vm: &mut Vm, proto: ProtoValue) -> Value {
        match proto {
            ProtoValue::Null => Value::Null,
            ProtoValue::Bool(b) => Value::Bool(b),
            ProtoValue::Number(n) => Value::Number(n),
            ProtoValue::Str(s) => vm.new_string(&s),
        }
    }
}
