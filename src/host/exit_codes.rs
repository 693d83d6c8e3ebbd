//! Human-readable explanations for container exit codes

/// Explain an exit code reported by `<engine> exec`
pub fn describe(code: i32) -> String {
    match code {
        0 => "Success".to_string(),
        125 => "The container engine failed to run the command (daemon error or invalid exec options)".to_string(),
        126 => "The command inside the container could not be invoked (permission denied or not executable)".to_string(),
        127 => "The command was not found inside the container (check the image and PATH)".to_string(),
        130 => "Terminated by SIGINT (interrupted)".to_string(),
        137 => "Terminated by SIGKILL, most likely out of memory or killed by an external timeout".to_string(),
        139 => "Terminated by SIGSEGV (segmentation fault)".to_string(),
        143 => "Terminated by SIGTERM".to_string(),
        129..=255 => format!("Terminated by signal {}", code - 128),
        _ => "Unknown failure of the container infrastructure".to_string(),
    }
}
