use anyhow::Result;
use sleet::Vm;
use std::thread;
use std::time::{Duration, Instant};

const FIBONACCI: &str = r#"
function fib(n) {
    if (n < 2) return n;
    return fib(n - 1) + fib(n - 2);
}
fib(24);
"#;

const NUMERIC_KERNEL: &str = r#"
function poly(x, y) {
    return x * x + y * y + x * y;
}
var total = 0;
var i = 0;
while (i < 100000) {
    total = total + poly(i, i + 1);
    i = i + 1;
}
"#;

const CLOSURES: &str = r#"
function adder(a, b) {
    return function(c) { return a + b + c; };
}
var add3 = adder(1, 2);
var sum = 0;
var i = 0;
while (i < 50000) {
    sum = sum + add3(i);
    i = i + 1;
}
"#;

const ITERATIONS: u32 = 10;

fn run_once(source: &str, jit: bool) -> Result<Duration> {
    let mut vm = Vm::new();
    vm.register_natives();
    vm.enable_jit(jit);
    let script = vm.compile_source(source, "benchmark")?;
    let start = Instant::now();
    vm.interpret(script)?;
    Ok(start.elapsed())
}

fn benchmark(name: &str, source: &str) {
    println!("{name}:");
    for (label, jit) in [("interpreter", false), ("jit", true)] {
        let mut total = Duration::ZERO;
        let mut failed = false;
        for _ in 0..ITERATIONS {
            match run_once(source, jit) {
                Ok(elapsed) => total += elapsed,
                Err(error) => {
                    eprintln!("  {label} error: {error}");
                    failed = true;
                    break;
                }
            }
        }
        if !failed {
            let per_iter = total.as_secs_f64() / ITERATIONS as f64 * 1000.0;
            println!("  {label:<12} {per_iter:>8.3}ms/iter");
        }
    }
    println!();
}

fn run_benchmarks() {
    println!("=== Interpreter vs JIT ===");
    println!("({ITERATIONS} iterations per benchmark)\n");

    benchmark("Fibonacci(24)", FIBONACCI);
    benchmark("Numeric kernel (100k calls)", NUMERIC_KERNEL);
    benchmark("Closures (50k calls)", CLOSURES);
}

fn main() {
    let builder = thread::Builder::new().stack_size(32 * 1024 * 1024);
    let handler = builder.spawn(run_benchmarks).unwrap();
    handler.join().unwrap();
}
