//! Built-in automation functions.
//!
//! These are the side-effecting collaborators the pipeline dispatches to:
//! launching desktop programs, reading system metrics, running shell commands
//! and simple file operations. The pipeline treats them as opaque callables.

use super::{Arguments, Catalogue, FunctionDescriptor, FunctionFault, InvocationContext};
use serde_json::{json, Value};
use std::fs;
use std::io::Read;
use std::path::Path;
use std::process::{Child, Command, Stdio};
use std::thread;
use std::time::Duration;
use sysinfo::{Disks, System, MINIMUM_CPU_UPDATE_INTERVAL};

const APPLICATION_CONTROL: &str = "application_control";
const SYSTEM_MONITORING: &str = "system_monitoring";
const COMMAND_EXECUTION: &str = "command_execution";

const GIB: f64 = 1024.0 * 1024.0 * 1024.0;

/// Poll interval while waiting on a shell command.
const CHILD_POLL_INTERVAL: Duration = Duration::from_millis(10);

type Builtin = fn(&Arguments, &InvocationContext) -> Result<Value, FunctionFault>;

fn descriptors() -> Vec<(FunctionDescriptor, Builtin)> {
    vec![
        (
            FunctionDescriptor::new(
                "open_chrome",
                "Opens Google Chrome web browser",
                &["chrome", "browser", "web", "google", "internet", "open", "launch", "start"],
                APPLICATION_CONTROL,
                &[],
            ),
            open_chrome as Builtin,
        ),
        (
            FunctionDescriptor::new(
                "open_calculator",
                "Opens the system calculator application",
                &["calculator", "calc", "math", "open", "launch", "start"],
                APPLICATION_CONTROL,
                &[],
            ),
            open_calculator as Builtin,
        ),
        (
            FunctionDescriptor::new(
                "open_notepad",
                "Opens the system text editor or notepad",
                &["notepad", "text editor", "editor", "text", "notes", "open", "launch", "start"],
                APPLICATION_CONTROL,
                &[],
            ),
            open_notepad as Builtin,
        ),
        (
            FunctionDescriptor::new(
                "open_file_explorer",
                "Opens the system file explorer or file manager",
                &["file explorer", "explorer", "file manager", "files", "browse", "open", "launch", "start"],
                APPLICATION_CONTROL,
                &[],
            ),
            open_file_explorer as Builtin,
        ),
        (
            FunctionDescriptor::new(
                "get_cpu_usage",
                "Returns the current CPU usage percentage",
                &["cpu", "processor", "usage", "load", "performance", "monitoring", "system", "stats"],
                SYSTEM_MONITORING,
                &[],
            ),
            get_cpu_usage as Builtin,
        ),
        (
            FunctionDescriptor::new(
                "get_memory_usage",
                "Returns information about RAM usage",
                &["memory", "ram", "usage", "monitoring", "system", "performance", "stats"],
                SYSTEM_MONITORING,
                &[],
            ),
            get_memory_usage as Builtin,
        ),
        (
            FunctionDescriptor::new(
                "get_disk_usage",
                "Returns information about disk space usage",
                &["disk", "storage", "drive", "space", "usage", "monitoring", "system", "stats"],
                SYSTEM_MONITORING,
                &[],
            ),
            get_disk_usage as Builtin,
        ),
        (
            FunctionDescriptor::new(
                "get_battery_status",
                "Returns battery status information if available",
                &["battery", "power", "status", "charge", "monitoring", "system", "laptop"],
                SYSTEM_MONITORING,
                &[],
            ),
            get_battery_status as Builtin,
        ),
        (
            FunctionDescriptor::new(
                "run_shell_command",
                "Executes a shell command and returns the output",
                &["shell", "command", "cmd", "terminal", "console", "execute", "run"],
                COMMAND_EXECUTION,
                &["command"],
            ),
            run_shell_command as Builtin,
        ),
        (
            FunctionDescriptor::new(
                "list_files_in_directory",
                "Lists all files in a specified directory",
                &["list", "files", "directory", "folder", "contents", "ls", "dir"],
                COMMAND_EXECUTION,
                &["directory"],
            ),
            list_files_in_directory as Builtin,
        ),
        (
            FunctionDescriptor::new(
                "get_system_info",
                "Returns basic system information",
                &["system", "info", "information", "details", "specs", "specifications", "os", "platform"],
                SYSTEM_MONITORING,
                &[],
            ),
            get_system_info as Builtin,
        ),
        (
            FunctionDescriptor::new(
                "create_file",
                "Creates a new file with optional content",
                &["create", "file", "new", "make", "write"],
                COMMAND_EXECUTION,
                &["filename", "content"],
            ),
            create_file as Builtin,
        ),
        (
            FunctionDescriptor::new(
                "read_file",
                "Reads the contents of a file",
                &["read", "file", "content", "open", "view"],
                COMMAND_EXECUTION,
                &["filename"],
            ),
            read_file as Builtin,
        ),
    ]
}

/// Build the catalogue of built-in functions.
pub fn catalogue() -> Catalogue {
    let mut catalogue = Catalogue::new();
    for (descriptor, function) in descriptors() {
        // Built-in names are static identifiers and unique.
        if let Err(e) = catalogue.register_fn(descriptor, function) {
            tracing::error!(error = %e, "Failed to register built-in function");
        }
    }
    catalogue
}

// ---------------------------------------------------------------------------
// Argument helpers
// ---------------------------------------------------------------------------

/// Optional string argument; JSON null counts as absent.
fn optional_str<'a>(args: &'a Arguments, name: &str) -> Result<Option<&'a str>, FunctionFault> {
    match args.get(name) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(s)) => Ok(Some(s.as_str())),
        Some(_) => Err(FunctionFault::InvalidParameter {
            name: name.to_string(),
            expected: "string",
        }),
    }
}

fn required_str<'a>(args: &'a Arguments, name: &str) -> Result<&'a str, FunctionFault> {
    optional_str(args, name)?.ok_or_else(|| FunctionFault::MissingParameter(name.to_string()))
}

fn gib(bytes: u64) -> String {
    format!("{:.2} GB", bytes as f64 / GIB)
}

fn percent(part: u64, total: u64) -> String {
    if total == 0 {
        return "0.0%".to_string();
    }
    format!("{:.1}%", part as f64 * 100.0 / total as f64)
}

// ---------------------------------------------------------------------------
// Application control
// ---------------------------------------------------------------------------

/// Spawn a detached program. The child is not waited on.
fn launch(program: &str, args: &[&str]) -> Result<Value, FunctionFault> {
    Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .spawn()
        .map(|child| {
            tracing::debug!(program, pid = child.id(), "Launched program");
            Value::Null
        })
        .map_err(|e| FunctionFault::Failed(format!("failed to launch {}: {}", program, e)))
}

fn open_chrome(_: &Arguments, _: &InvocationContext) -> Result<Value, FunctionFault> {
    const URL: &str = "https://www.google.com";
    if cfg!(target_os = "windows") {
        launch("cmd", &["/C", "start", "chrome", URL])
    } else if cfg!(target_os = "macos") {
        launch("open", &[URL])
    } else {
        launch("xdg-open", &[URL])
    }
}

fn open_calculator(_: &Arguments, _: &InvocationContext) -> Result<Value, FunctionFault> {
    if cfg!(target_os = "windows") {
        launch("calc", &[])
    } else if cfg!(target_os = "macos") {
        launch("open", &["-a", "Calculator"])
    } else {
        launch("gnome-calculator", &[])
    }
}

fn open_notepad(_: &Arguments, _: &InvocationContext) -> Result<Value, FunctionFault> {
    if cfg!(target_os = "windows") {
        launch("notepad", &[])
    } else if cfg!(target_os = "macos") {
        launch("open", &["-a", "TextEdit"])
    } else {
        launch("gedit", &[])
    }
}

fn open_file_explorer(_: &Arguments, _: &InvocationContext) -> Result<Value, FunctionFault> {
    if cfg!(target_os = "windows") {
        launch("explorer", &[])
    } else if cfg!(target_os = "macos") {
        launch("open", &["."])
    } else {
        launch("xdg-open", &["."])
    }
}

// ---------------------------------------------------------------------------
// System monitoring
// ---------------------------------------------------------------------------

fn get_cpu_usage(_: &Arguments, ctx: &InvocationContext) -> Result<Value, FunctionFault> {
    let mut sys = System::new();
    sys.refresh_cpu();
    // Usage is a delta between two refreshes.
    thread::sleep(MINIMUM_CPU_UPDATE_INTERVAL.max(Duration::from_millis(250)));
    if ctx.is_cancelled() {
        return Err(FunctionFault::Cancelled);
    }
    sys.refresh_cpu();

    let usage = (sys.global_cpu_info().cpu_usage() * 10.0).round() / 10.0;
    Ok(json!(usage))
}

fn get_memory_usage(_: &Arguments, _: &InvocationContext) -> Result<Value, FunctionFault> {
    let mut sys = System::new();
    sys.refresh_memory();

    let total = sys.total_memory();
    Ok(json!({
        "total": gib(total),
        "available": gib(sys.available_memory()),
        "percent_used": percent(sys.used_memory(), total),
        "used": gib(sys.used_memory()),
    }))
}

fn get_disk_usage(_: &Arguments, _: &InvocationContext) -> Result<Value, FunctionFault> {
    let disks = Disks::new_with_refreshed_list();
    let root = if cfg!(target_os = "windows") {
        Path::new("C:\\")
    } else {
        Path::new("/")
    };

    let disk = disks
        .list()
        .iter()
        .find(|d| d.mount_point() == root)
        .or_else(|| disks.list().first())
        .ok_or_else(|| FunctionFault::Failed("no disks detected".to_string()))?;

    let total = disk.total_space();
    let free = disk.available_space();
    let used = total.saturating_sub(free);
    Ok(json!({
        "total": gib(total),
        "used": gib(used),
        "free": gib(free),
        "percent_used": percent(used, total),
    }))
}

fn get_battery_status(_: &Arguments, _: &InvocationContext) -> Result<Value, FunctionFault> {
    Ok(read_battery(Path::new("/sys/class/power_supply"))
        .unwrap_or_else(|| json!({ "error": "No battery detected" })))
}

/// Read the first `BAT*` entry of a Linux power-supply class directory.
fn read_battery(power_supply: &Path) -> Option<Value> {
    let mut batteries: Vec<_> = fs::read_dir(power_supply)
        .ok()?
        .filter_map(|e| e.ok())
        .filter(|e| e.file_name().to_string_lossy().starts_with("BAT"))
        .map(|e| e.path())
        .collect();
    batteries.sort();
    let battery = batteries.first()?;

    let read = |name: &str| {
        fs::read_to_string(battery.join(name))
            .ok()
            .map(|s| s.trim().to_string())
    };
    let capacity = read("capacity")?;
    let status = read("status").unwrap_or_else(|| "Unknown".to_string());

    Some(json!({
        "percent": format!("{}%", capacity),
        "power_plugged": status != "Discharging",
        "status": status,
    }))
}

fn get_system_info(_: &Arguments, _: &InvocationContext) -> Result<Value, FunctionFault> {
    let mut sys = System::new();
    sys.refresh_cpu();
    let processor = sys
        .cpus()
        .first()
        .map(|cpu| cpu.brand().to_string())
        .unwrap_or_default();

    Ok(json!({
        "system": System::name().unwrap_or_default(),
        "node": System::host_name().unwrap_or_default(),
        "release": System::kernel_version().unwrap_or_default(),
        "version": System::os_version().unwrap_or_default(),
        "machine": std::env::consts::ARCH,
        "processor": processor,
        "service_version": env!("CARGO_PKG_VERSION"),
    }))
}

// ---------------------------------------------------------------------------
// Command execution
// ---------------------------------------------------------------------------

fn shell(command: &str) -> Command {
    if cfg!(target_os = "windows") {
        let mut cmd = Command::new("cmd");
        cmd.args(["/C", command]);
        cmd
    } else {
        let mut cmd = Command::new("sh");
        cmd.args(["-c", command]);
        cmd
    }
}

/// Drain a child pipe on its own thread so a chatty child cannot fill the pipe
/// and stall while we poll for exit.
fn drain<R: Read + Send + 'static>(pipe: Option<R>) -> thread::JoinHandle<String> {
    thread::spawn(move || {
        let mut buf = Vec::new();
        if let Some(mut pipe) = pipe {
            let _ = pipe.read_to_end(&mut buf);
        }
        String::from_utf8_lossy(&buf).into_owned()
    })
}

fn wait_cancellable(child: &mut Child, ctx: &InvocationContext) -> Result<bool, FunctionFault> {
    loop {
        match child.try_wait() {
            Ok(Some(status)) => return Ok(status.success()),
            Ok(None) => {
                if ctx.is_cancelled() {
                    let _ = child.kill();
                    let _ = child.wait();
                    return Err(FunctionFault::Cancelled);
                }
                thread::sleep(CHILD_POLL_INTERVAL);
            }
            Err(e) => return Err(FunctionFault::Failed(format!("wait failed: {}", e))),
        }
    }
}

fn run_shell_command(args: &Arguments, ctx: &InvocationContext) -> Result<Value, FunctionFault> {
    let command = required_str(args, "command")?;

    let mut child = shell(command)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|e| FunctionFault::Failed(format!("spawn failed: {}", e)))?;

    let stdout = drain(child.stdout.take());
    let stderr = drain(child.stderr.take());
    let success = wait_cancellable(&mut child, ctx)?;

    Ok(json!({
        "success": success,
        "output": stdout.join().unwrap_or_default(),
        "error": stderr.join().unwrap_or_default(),
    }))
}

fn list_files_in_directory(
    args: &Arguments,
    _: &InvocationContext,
) -> Result<Value, FunctionFault> {
    let directory = optional_str(args, "directory")?.unwrap_or(".");

    let entries = match fs::read_dir(directory) {
        Ok(entries) => entries,
        Err(e) => return Ok(json!({ "success": false, "error": e.to_string() })),
    };
    let mut files: Vec<String> = entries
        .filter_map(|e| e.ok())
        .map(|e| e.file_name().to_string_lossy().into_owned())
        .collect();
    files.sort();

    Ok(json!({ "success": true, "files": files }))
}

fn create_file(args: &Arguments, _: &InvocationContext) -> Result<Value, FunctionFault> {
    let filename = required_str(args, "filename")?;
    let content = optional_str(args, "content")?.unwrap_or("");

    Ok(match fs::write(filename, content) {
        Ok(()) => json!({
            "success": true,
            "message": format!("File {} created successfully", filename),
        }),
        Err(e) => json!({ "success": false, "error": e.to_string() }),
    })
}

fn read_file(args: &Arguments, _: &InvocationContext) -> Result<Value, FunctionFault> {
    let filename = required_str(args, "filename")?;

    Ok(match fs::read_to_string(filename) {
        Ok(content) => json!({ "success": true, "content": content }),
        Err(e) => json!({ "success": false, "error": e.to_string() }),
    })
}
