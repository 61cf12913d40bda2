//! Thin launcher shim (§10.1, §10.3): turns `-D`/`-cp`/config-file CLI
//! arguments into a [`VmConfig`], wires up a `tracing_subscriber` filtered
//! by `jc.verbose.<tag>`, boots a [`Jvm`], and runs a main class's
//! `public static void main(String[])`.
//!
//! Everything about argument syntax itself is out of scope for the core
//! (see `spec.md`'s Non-goals); this binary owns only enough of it to reach
//! a runnable `VmConfig` and a class name.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::process::ExitCode;

use exo_jvm::config::VmConfig;
use exo_jvm::object::Value;
use exo_jvm::properties;
use exo_jvm::thread::ThreadHandle;
use exo_jvm::types::TypeName;
use exo_jvm::{Jvm, VmError, VmResult};

struct Launch {
    config_path: Option<PathBuf>,
    properties: BTreeMap<String, String>,
    main_class: String,
}

fn parse_args() -> Result<Launch, String> {
    let mut properties = BTreeMap::new();
    let mut config_path = None;
    let mut main_class = None;

    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        if let Some(rest) = arg.strip_prefix("-D") {
            let (key, value) = rest
                .split_once('=')
                .ok_or_else(|| format!("malformed -D flag: {arg}"))?;
            properties.insert(key.to_string(), value.to_string());
        } else if arg == "-cp" || arg == "-classpath" {
            let path = args
                .next()
                .ok_or_else(|| format!("{arg} requires a path argument"))?;
            properties.insert(properties::BOOT_CLASS_PATH.to_string(), path);
        } else if let Some(path) = arg.strip_prefix("-config=") {
            config_path = Some(PathBuf::from(path));
        } else if main_class.is_none() {
            main_class = Some(arg);
        }
        // Anything after the main class name is the launched program's own
        // argv; handing it to Java as a populated String[] needs the
        // reflection/string-intern surface this crate doesn't implement, so
        // main() is always invoked with a zero-length array (see run_main).
    }

    let main_class = main_class.ok_or_else(|| {
        "usage: exo-java [-Dkey=value]... [-cp PATH] [-config=FILE] <main-class>".to_string()
    })?;

    Ok(Launch {
        config_path,
        properties,
        main_class,
    })
}

/// Installs a `tracing_subscriber::fmt` subscriber at `warn` by default,
/// raising each `jc.verbose.<tag>` target (`loader`, `derive`, `gc`, `lock`,
/// `interp`) to `debug` individually rather than turning on every target at
/// once.
fn install_tracing(config: &VmConfig) {
    use tracing_subscriber::filter::EnvFilter;

    let mut filter = EnvFilter::new("warn");
    for tag in &config.verbose_tags {
        match format!("{tag}=debug").parse() {
            Ok(directive) => filter = filter.add_directive(directive),
            Err(e) => eprintln!("ignoring unrecognized verbose tag {tag:?}: {e}"),
        }
    }
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

fn main() -> ExitCode {
    let launch = match parse_args() {
        Ok(l) => l,
        Err(e) => {
            eprintln!("{e}");
            return ExitCode::FAILURE;
        }
    };

    let config = match VmConfig::from_properties(launch.config_path.as_deref(), &launch.properties) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("configuration error: {e}");
            return ExitCode::FAILURE;
        }
    };

    install_tracing(&config);

    let jvm = match Jvm::new(config) {
        Ok(jvm) => jvm,
        Err(e) => {
            eprintln!("failed to start VM: {e}");
            return ExitCode::FAILURE;
        }
    };

    let thread = jvm.attach_thread();
    let result = run_main(&jvm, &thread, &launch.main_class);
    jvm.detach_thread(thread.id);

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Exception in thread \"main\" {e}");
            ExitCode::FAILURE
        }
    }
}

fn run_main(jvm: &Jvm, thread: &ThreadHandle, main_class: &str) -> VmResult<()> {
    let loader = jvm.loaders().bootstrap();
    let name = TypeName(main_class.replace('.', "/"));
    let ty = jvm.resolve_class(&loader, &name, thread)?;

    let main_method = ty
        .find_method("main", "([Ljava/lang/String;)V")
        .ok_or_else(|| VmError::NoSuchMethod {
            class: name.clone(),
            name: "main".to_string(),
            descriptor: "([Ljava/lang/String;)V".to_string(),
        })?;

    let args_ty = jvm.resolve_class(&loader, &TypeName("[Ljava/lang/String;".to_string()), thread)?;
    let args_array = jvm.new_array(&args_ty, 0)?;

    jvm.invoke(thread, main_method, &[Value::Ref(Some(args_array))])?;
    Ok(())
}
