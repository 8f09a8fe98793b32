use std::io::{BufRead, Write};

use chat_language_model::{CausalLanguageModel, ChatTokenizer};

use crate::{Session, SessionError};

/// Read one line after printing `prompt`. Returns `None` once the input is closed.
pub fn prompt_input(
    prompt: &str,
    input: &mut impl BufRead,
    output: &mut impl Write,
) -> Result<Option<String>, std::io::Error> {
    write!(output, "{prompt}")?;
    output.flush()?;
    let mut line = String::new();
    if input.read_line(&mut line)? == 0 {
        return Ok(None);
    }
    if line.ends_with('\n') {
        line.pop();
        if line.ends_with('\r') {
            line.pop();
        }
    }
    Ok(Some(line))
}

/// Chat until the input closes or the user types `exit_command`.
pub fn run<M, T>(
    session: &mut Session<M, T>,
    exit_command: Option<&str>,
    mut input: impl BufRead,
    mut output: impl Write,
) -> Result<(), SessionError>
where
    M: CausalLanguageModel,
    T: ChatTokenizer,
{
    loop {
        let Some(user_input) = prompt_input("User: ", &mut input, &mut output)? else {
            writeln!(output)?;
            tracing::info!("Input closed, ending the chat");
            return Ok(());
        };
        if exit_command == Some(user_input.as_str()) {
            tracing::info!("Exit command received, ending the chat");
            return Ok(());
        }
        let response = session.respond(&user_input)?;
        writeln!(output, "Model: {response}")?;
        output.flush()?;
    }
}
