use broker::error::{get_error_info, BrokerError};
use serde_json::{json, Value};

pub fn emit_output(command: &str, payload: Value) {
    println!(
        "{}",
        json!({
            "command": command,
            "status": "ok",
            "payload": payload,
        })
    );
}

pub fn emit_error(error_code: &str, message: &str, suggestions: &[String]) {
    let fix = get_error_info(error_code).map(|(_, fix)| fix);
    eprintln!(
        "{}",
        json!({
            "status": "error",
            "code": error_code,
            "message": message,
            "fix": fix,
            "suggestions": suggestions,
        })
    );
}

pub fn emit_broker_error(error: &BrokerError) -> i32 {
    emit_error(error.code(), &error.to_string(), &[]);
    error.exit_code()
}

pub const CLI_EXIT_CODE: i32 = 1;
