use anyhow::Result;
use std::io::{self, BufRead, Write};

/// Read one line from stdin without its line ending.
pub fn prompt_string(prompt: &str) -> Result<String> {
    print!("{prompt}");
    io::stdout().flush()?;
    let mut line = String::new();
    io::stdin().lock().read_line(&mut line)?;
    let len = line.trim_end_matches(['\r', '\n']).len();
    line.truncate(len);
    Ok(line)
}

/// Empty answer becomes `None`.
pub fn prompt_optional(prompt: &str) -> Result<Option<String>> {
    let s = prompt_string(prompt)?;
    Ok(if s.trim().is_empty() { None } else { Some(s) })
}

pub fn prompt_password_hidden(prompt: &str) -> Result<String> {
    Ok(rpassword::prompt_password(prompt)?)
}
