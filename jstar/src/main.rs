use std::path::{Path, PathBuf};
use std::{env, fs, process};

use jstar_sys::vm::serialize;
use jstar_sys::vm::{Raised, Stack, VirtualMachine};
use jstar_sys::{Config, JStarResult};

#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

fn main() {
    let args: Vec<String> = env::args().collect();
    let options = match parse_args(args) {
        Some(options) => options,
        None => return,
    };
    process::exit(run(options));
}

struct Options {
    file: Option<String>,
    args: Vec<String>,
    ignore_env: bool,
    no_color: bool,
}

fn parse_args(args: Vec<String>) -> Option<Options> {
    let mut iter = args.into_iter();
    let mut options = Options { file: None, args: Vec::new(), ignore_env: false, no_color: false };

    if iter.next().is_none() {
        panic!("Unexpected first argument");
    }

    for arg in iter.by_ref() {
        match arg.as_str() {
            "-h" | "--help" => {
                print_help();
                return None;
            }
            "-v" | "--version" => {
                println!("J* {}", env!("CARGO_PKG_VERSION"));
                return None;
            }
            "-E" => options.ignore_env = true,
            "-C" => options.no_color = true,
            a => {
                options.file = Some(String::from(a));
                break;
            }
        }
    }

    options.args.extend(iter);
    Some(options)
}

fn run(options: Options) -> i32 {
    let file = match options.file {
        Some(file) => file,
        None => {
            print_help();
            return 0;
        }
    };

    let no_color = options.no_color;
    let config = Config {
        error_callback: Some(Box::new(move |_result, source, msg| {
            let (red, reset) = if no_color { ("", "") } else { ("\x1b[1;31m", "\x1b[0m") };
            eprintln!("{}Error in {}{}", red, source, reset);
            eprintln!("{}", msg);
        })),
        ..Config::default()
    };
    let mut vm = VirtualMachine::new(config);

    // JSTARPATH entries come first, then the script's own directory.
    if !options.ignore_env {
        if let Ok(paths) = env::var("JSTARPATH") {
            for p in paths.split(':').filter(|p| !p.is_empty()) {
                vm.add_import_path(PathBuf::from(p));
            }
        }
    }
    if let Some(dir) = Path::new(&file).parent() {
        vm.add_import_path(dir.to_path_buf());
    }
    vm.add_import_path(PathBuf::from("."));

    vm.define_native("__main__", "print", 0, true, print_native);

    vm.push_list();
    for arg in &options.args {
        vm.push_str(arg);
        vm.list_append(-2);
    }
    vm.define_global("__main__", "argv");

    let bytes = match fs::read(&file) {
        Ok(bytes) => bytes,
        Err(e) => {
            eprintln!("Unable to read file '{}': {}", file, e);
            return JStarResult::IoErr.exit_code();
        }
    };

    let main_module = vm.main_module();
    let fun = match serialize::deserialize_function(&mut vm, &bytes, main_module) {
        Ok(fun) => fun,
        Err(e) => {
            eprintln!("'{}' is not a valid bytecode file: {}", file, e);
            return JStarResult::CompileErr.exit_code();
        }
    };

    vm.pop();
    vm.eval_function(fun).exit_code()
}

fn print_native(vm: &mut VirtualMachine) -> Result<(), Raised> {
    let args = vm.get_slot(1);
    let parts = vm.sequence_values(args).unwrap_or_default();
    let line = parts.iter().map(|v| vm.to_display(*v)).collect::<Vec<String>>().join(" ");
    println!("{}", line);
    vm.push_null();
    Ok(())
}

fn print_help() {
    println!("jstar [options] <script.jsb> [script arguments...]");
    println!("Runs a compiled J* bytecode file.");
    println!("Options:");
    println!("  -h --help    : Show this message and then exit.");
    println!("  -v --version : Print the version and then exit.");
    println!("  -E           : Ignore the JSTARPATH environment variable.");
    println!("  -C           : Disable colorized error output.");
}
