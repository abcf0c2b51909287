//! End-to-end interpreter tests: compile and run source, assert on
//! captured print output and the interpreter status.

use tael_vm::{InterpretResult, Vm};

fn run(source: &str) -> (InterpretResult, String) {
    let mut vm = Vm::new();
    vm.capture_output();
    let result = vm.interpret(source);
    let output = vm.take_output();
    (result, output)
}

fn run_ok(source: &str) -> String {
    let (result, output) = run(source);
    assert_eq!(result, InterpretResult::Ok, "output so far: {output:?}");
    output
}

#[test]
fn prints_arithmetic() {
    assert_eq!(run_ok("print(1 + 2 * 3)"), "7\n");
    assert_eq!(run_ok("print(10 - 2 - 3)"), "5\n");
    assert_eq!(run_ok("print(7 // 2, 7 % 3)"), "3 1\n");
    // Power binds right.
    assert_eq!(run_ok("print(2 ^ 3 ^ 2)"), "512\n");
    assert_eq!(run_ok("print(-(3 + 4))"), "-7\n");
}

#[test]
fn division_by_zero_follows_ieee() {
    assert_eq!(run_ok("print(1 / 0)"), "inf\n");
    assert_eq!(run_ok("print(-1 / 0)"), "-inf\n");
    assert_eq!(run_ok("print(0 / 0)"), "nan\n");
    // Integer modulo with a zero divisor falls back to fmod.
    assert_eq!(run_ok("print(5 % 0)"), "nan\n");
}

#[test]
fn string_concat_and_interpolation() {
    assert_eq!(run_ok("print(\"foo\" + \"bar\")"), "foobar\n");
    assert_eq!(run_ok("name = \"world\"\nprint(\"hello {name}!\")"), "hello world!\n");
    assert_eq!(run_ok("print(\"2 + 2 = {2 + 2}\")"), "2 + 2 = 4\n");
}

#[test]
fn comparisons_and_logic() {
    assert_eq!(run_ok("print(1 < 2, 2 <= 2, 3 > 4, 3 >= 4)"), "true true false false\n");
    assert_eq!(run_ok("print(1 == 1.0, \"a\" == \"a\", \"a\" != \"b\")"), "true true true\n");
    assert_eq!(run_ok("print(false or 5, 3 and 7, not nil)"), "5 7 true\n");
}

#[test]
fn globals_and_locals() {
    let source = "x = 10\nlocal y = 20\nprint(x + y)";
    assert_eq!(run_ok(source), "30\n");
}

#[test]
fn undefined_global_is_a_runtime_error() {
    let (result, _) = run("print(missing)");
    assert_eq!(result, InterpretResult::RuntimeError);
    assert_eq!(result.exit_code(), 70);
}

#[test]
fn if_elif_else_indented() {
    let source = "\
fn classify(n):
    if n < 0:
        print(\"negative\")
    elif n == 0:
        print(\"zero\")
    else:
        print(\"positive\")

classify(-1)
classify(0)
classify(5)
";
    assert_eq!(run_ok(source), "negative\nzero\npositive\n");
}

#[test]
fn while_loop_with_break_and_continue() {
    let source = "\
local i = 0
while true:
    i = i + 1
    if i == 2:
        continue
    if i > 4:
        break
    print(i)
";
    assert_eq!(run_ok(source), "1\n3\n4\n");
}

#[test]
fn numeric_for_loop() {
    assert_eq!(run_ok("for i = 1, 3: print(i)"), "1\n2\n3\n");
}

#[test]
fn for_in_over_range() {
    assert_eq!(run_ok("for i in 1..4: print(i)"), "1\n2\n3\n4\n");
}

#[test]
fn for_in_over_table_literal() {
    assert_eq!(run_ok("for v in {10, 20, 30}: print(v)"), "10\n20\n30\n");
}

#[test]
fn for_in_over_table_pairs() {
    let source = "\
t = {}
t.a = 1
local total = 0
for k, v in t:
    total = total + v
print(total)
";
    assert_eq!(run_ok(source), "1\n");
}

#[test]
fn for_in_over_string() {
    assert_eq!(run_ok("for c in \"ab\": print(c)"), "a\nb\n");
}

#[test]
fn closures_capture_by_reference() {
    let source = "fn make() local x = 0; return fn() x = x + 1; return x; end; end; \
c = make(); print(c(), c(), c())";
    assert_eq!(run_ok(source), "1 2 3\n");
}

#[test]
fn sibling_closures_share_one_upvalue() {
    let source = "\
fn pair():
    local n = 0
    fn bump() n = n + 10; return n; end
    fn read() return n; end
    return bump, read

local bump, read = pair()
bump()
bump()
print(read())
";
    assert_eq!(run_ok(source), "20\n");
}

#[test]
fn generators_yield_values_in_order() {
    let source = "fn g() for i in 1..3: yield i*i; end; for _, v in g(): print(v)";
    assert_eq!(run_ok(source), "1\n4\n9\n");
}

#[test]
fn try_finally_runs_even_on_throw() {
    let (result, output) = run("try: throw \"boom\"; finally: print(\"cleanup\"); end");
    assert_eq!(output, "cleanup\n");
    assert_eq!(result, InterpretResult::RuntimeError);
    assert_eq!(result.exit_code(), 70);
}

#[test]
fn except_catches_and_binds() {
    let source = "try: throw \"bad\"; except as e: print(\"caught\", e)";
    assert_eq!(run_ok(source), "caught bad\n");
}

#[test]
fn except_filter_matches_payload() {
    let source = "try: throw \"boom\"; except \"boom\" as e: print(\"got\", e)";
    assert_eq!(run_ok(source), "got boom\n");
}

#[test]
fn except_filter_mismatch_rethrows_through_finally() {
    let source = "try: throw \"x\"; except \"y\" as e: print(\"no\"); finally: print(\"fin\")";
    let (result, output) = run(source);
    assert_eq!(output, "fin\n");
    assert_eq!(result, InterpretResult::RuntimeError);
}

#[test]
fn finally_runs_after_handled_exception() {
    let source = "try: throw \"oops\"; except as e: print(\"handled\"); finally: print(\"fin\"); end; print(\"after\")";
    assert_eq!(run_ok(source), "handled\nfin\nafter\n");
}

#[test]
fn exceptions_unwind_nested_frames() {
    let source = "\
fn inner() throw \"deep\"; end
fn outer() inner(); print(\"unreachable\"); end
try: outer(); except as e: print(\"caught\", e)
";
    assert_eq!(run_ok(source), "caught deep\n");
}

#[test]
fn metatable_index_chain() {
    let source = "\
a = {}
a.x = 7
b = {}
setmetatable(b, {__index = a})
print(b.x)
b.x = 9
print(a.x, b.x)
";
    assert_eq!(run_ok(source), "7\n7 9\n");
}

#[test]
fn methods_bind_their_receiver() {
    let source = "\
Point = {}
Point.__index = Point
fn Point.mag() return self.x * self.x + self.y * self.y; end
p = {x = 3, y = 4}
setmetatable(p, Point)
print(p.mag())
";
    assert_eq!(run_ok(source), "25\n");
}

#[test]
fn instantiation_attaches_metatable() {
    let source = "\
Point = {}
Point.__index = Point
fn Point.mag() return self.x * self.x + self.y * self.y; end
q = Point {x = 1, y = 2}
print(q.mag())
";
    assert_eq!(run_ok(source), "5\n");
}

#[test]
fn call_metamethod_makes_tables_callable() {
    let source = "\
adder = {}
setmetatable(adder, {__call = fn(this, n) return n + 1; end})
print(adder(41))
";
    assert_eq!(run_ok(source), "42\n");
}

#[test]
fn named_arguments_bind_by_name() {
    let source = "fn f(a, b=10, c=20) return a+b+c; end; print(f(1, c=5))";
    assert_eq!(run_ok(source), "16\n");
}

#[test]
fn duplicate_named_argument_is_an_error() {
    let (result, _) = run("fn f(a) return a; end; print(f(1, a=2))");
    assert_eq!(result, InterpretResult::RuntimeError);
}

#[test]
fn unmatched_named_arguments_pack_into_opts() {
    let source = "fn f(a, opts) return a + opts.extra; end; print(f(1, extra=9))";
    assert_eq!(run_ok(source), "10\n");
}

#[test]
fn multi_return_and_unpack() {
    let source = "fn pair() return 1, 2; end; local x, y = pair(); print(x+y)";
    assert_eq!(run_ok(source), "3\n");
}

#[test]
fn single_table_return_unpacks_elements() {
    let source = "fn f() return {7, 8}; end; local a, b = f(); print(a, b)";
    assert_eq!(run_ok(source), "7 8\n");
}

#[test]
fn variadic_functions_pack_extras() {
    let source = "fn f(a, *rest) return a + #rest; end; print(f(1, 2, 3, 4))";
    assert_eq!(run_ok(source), "4\n");
}

#[test]
fn variadic_requires_leading_arguments() {
    let (result, _) = run("fn f(a, b, *rest) return a; end; f(1)");
    assert_eq!(result, InterpretResult::RuntimeError);
}

#[test]
fn spread_call_expands_table() {
    let source = "args = {2, 3}; fn add(a, b) return a+b; end; print(add(*args))";
    assert_eq!(run_ok(source), "5\n");
}

#[test]
fn length_operator() {
    assert_eq!(run_ok("print(#\"hello\", #{1, 2, 3})"), "5 3\n");
}

#[test]
fn membership_operators() {
    let source = "t = {1, 2}; print(2 in t, 3 in t, \"ell\" in \"hello\", t has 1)";
    assert_eq!(run_ok(source), "true false true true\n");
}

#[test]
fn string_indexing_is_one_based_and_wraps() {
    let source = "s = \"hello\"; print(s[1], s[-1], s[99])";
    assert_eq!(run_ok(source), "h o nil\n");
}

#[test]
fn string_methods_bind_the_receiver() {
    assert_eq!(run_ok("print(\"abc\".upper())"), "ABC\n");
    assert_eq!(run_ok("print(\"HI\".lower(), \"  x \".trim())"), "hi x\n");
    assert_eq!(run_ok("print(\"hello\".find(\"ll\"))"), "3\n");
    assert_eq!(run_ok("print(\"ab\".rep(3))"), "ababab\n");
}

#[test]
fn table_slices() {
    let source = "t = {1, 2, 3, 4, 5}; u = t[2..4]; print(#u, u[1], u[3])";
    assert_eq!(run_ok(source), "3 2 4\n");
}

#[test]
fn string_slices_with_step() {
    assert_eq!(run_ok("print(\"hello\"[2..4])"), "ell\n");
    assert_eq!(run_ok("print(\"abcdef\"[..:2])"), "ace\n");
    // Negative step iterates descending.
    assert_eq!(run_ok("print(\"abc\"[..:-1])"), "cba\n");
}

#[test]
fn slice_step_zero_is_an_error() {
    let (result, _) = run("print(\"abc\"[1..2:0])");
    assert_eq!(result, InterpretResult::RuntimeError);
}

#[test]
fn table_array_and_hash_round_trip() {
    let source = "\
t = {}
t[1] = \"a\"
t[2] = \"b\"
t.key = \"c\"
print(t[1], t[2], t.key, t[3])
";
    assert_eq!(run_ok(source), "a b c nil\n");
}

#[test]
fn negative_table_index_reads_from_the_end() {
    assert_eq!(run_ok("t = {10, 20, 30}; print(t[-1])"), "30\n");
}

#[test]
fn number_keys_canonicalize_off_the_dense_part() {
    // 2.5 cannot live in the array part; it round-trips via the sigil key.
    assert_eq!(run_ok("t = {}; t[2.5] = \"q\"; print(t[2.5])"), "q\n");
}

#[test]
fn match_statement_selects_a_case() {
    let source = "match 2: case 1: print(\"one\"); case 2: print(\"two\"); else: print(\"many\")";
    assert_eq!(run_ok(source), "two\n");
    let source = "match 9: case 1: print(\"one\"); case _: print(\"other\")";
    assert_eq!(run_ok(source), "other\n");
}

#[test]
fn conversions_round_trip() {
    assert_eq!(run_ok("print(number(\"1.5\") + 1)"), "2.5\n");
    assert_eq!(run_ok("print(str(42) + \"!\")"), "42!\n");
    assert_eq!(run_ok("print(int(3.7), float(2))"), "3 2\n");
    assert_eq!(run_ok("print(type(1), type(\"s\"), type({}), type(nil))"), "number string table nil\n");
}

#[test]
fn str_metamethod_drives_printing() {
    let source = "\
box = {v = 5}
setmetatable(box, {__str = fn(this) return \"box({this.v})\"; end})
print(box)
";
    assert_eq!(run_ok(source), "box(5)\n");
}

#[test]
fn explicit_coroutines_resume_and_yield() {
    let source = "import coroutine; \
fn worker(x) local got = coroutine.yield(x + 1); return got * 2; end; \
co = coroutine.create(worker); \
local ok, v = coroutine.resume(co, 1); print(ok, v); \
local ok2, v2 = coroutine.resume(co, 10); print(ok2, v2); \
print(coroutine.status(co))";
    assert_eq!(run_ok(source), "true 2\ntrue 20\ndead\n");
}

#[test]
fn resuming_a_dead_coroutine_reports_failure() {
    let source = "import coroutine; \
fn w() return 1; end; co = coroutine.create(w); \
coroutine.resume(co); \
local ok, msg = coroutine.resume(co); print(ok, msg)";
    assert_eq!(run_ok(source), "false cannot resume dead coroutine\n");
}

#[test]
fn math_module_fast_paths() {
    let source = "import math; print(math.floor(2.7), math.abs(-4), math.sqrt(16))";
    assert_eq!(run_ok(source), "2 4 4\n");
}

#[test]
fn from_import_extracts_names() {
    assert_eq!(run_ok("from math import floor, ceil; print(floor(1.5), ceil(1.5))"), "1 2\n");
}

#[test]
fn from_import_star_skips_private_names() {
    assert_eq!(run_ok("from math import *; print(floor(9.9))"), "9\n");
}

#[test]
fn source_modules_compile_once_and_cache() {
    let dir = std::env::temp_dir().join(format!("tael-mod-{}", std::process::id()));
    std::fs::create_dir_all(&dir).unwrap();
    std::fs::write(
        dir.join("answers.tl"),
        "print(\"loading\")\nlocal m = {}\nm.value = 41\nreturn m\n",
    )
    .unwrap();

    let mut options = tael_vm::VmOptions::default();
    options.search_paths = vec![dir.clone()];
    let mut vm = Vm::with_options(options);
    vm.capture_output();
    let result = vm.interpret(
        "import answers\nprint(answers.value + 1)\nimport answers\nprint(answers.value)\n",
    );
    let output = vm.take_output();
    std::fs::remove_dir_all(&dir).ok();
    assert_eq!(result, InterpretResult::Ok);
    // "loading" appears once: the second import hits the cache.
    assert_eq!(output, "loading\n42\n41\n");
}

#[test]
fn module_context_globals_are_scoped_to_the_module() {
    let dir = std::env::temp_dir().join(format!("tael-ctx-{}", std::process::id()));
    std::fs::create_dir_all(&dir).unwrap();
    std::fs::write(dir.join("who.tl"), "print(__name, __main)\nreturn {}\n").unwrap();

    let mut options = tael_vm::VmOptions::default();
    options.search_paths = vec![dir.clone()];
    let mut vm = Vm::with_options(options);
    vm.capture_output();
    let result = vm.interpret("import who\nprint(__main)\n");
    let output = vm.take_output();
    std::fs::remove_dir_all(&dir).ok();
    assert_eq!(result, InterpretResult::Ok);
    assert_eq!(output, "who false\ntrue\n");
}

#[test]
fn default_parameters_fill_trailing_slots() {
    assert_eq!(run_ok("fn f(a, b=2) return a + b; end; print(f(1), f(1, 10))"), "3 11\n");
}

#[test]
fn type_hints_are_checked_at_call_time() {
    let (result, _) = run("fn f(a: int) return a; end; f(\"nope\")");
    assert_eq!(result, InterpretResult::RuntimeError);
    assert_eq!(run_ok("fn f(a: int) return a; end; print(f(3))"), "3\n");
}

#[test]
fn compile_errors_report_without_running() {
    let (result, output) = run("fn ( nope");
    assert_eq!(result, InterpretResult::CompileError);
    assert_eq!(result.exit_code(), 65);
    assert_eq!(output, "");
}

#[test]
fn docstrings_attach_to_functions() {
    let source = "fn doc() \"adds numbers\"; return 1; end; print(doc())";
    assert_eq!(run_ok(source), "1\n");
}

#[test]
fn tables_print_canonically() {
    assert_eq!(run_ok("print({1, 2})"), "{1, 2}\n");
    assert_eq!(run_ok("t = {}; t.k = \"v\"; print(t)"), "{k: \"v\"}\n");
}

#[test]
fn error_builtin_throws() {
    let source = "try: error(\"blown\"); except as e: print(e)";
    assert_eq!(run_ok(source), "blown\n");
}

#[test]
fn interrupt_requests_surface_as_runtime_errors() {
    let mut vm = Vm::new();
    vm.capture_output();
    vm.request_interrupt();
    let result = vm.interpret("print(1)");
    assert_eq!(result, InterpretResult::RuntimeError);
}
