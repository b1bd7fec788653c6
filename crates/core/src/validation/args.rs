//! Secondary defense for argument vectors.
//!
//! The process runner never goes through a shell, so these characters have
//! no special meaning when spawning. Rejecting them anyway keeps a
//! compromised option value from becoming dangerous if a command line is
//! ever copied into a terminal or a script.

use super::ValidationError;

/// Characters with special meaning to POSIX shells and `cmd.exe`.
const SHELL_METACHARACTERS: &[char] = &[';', '&', '|', '`', '$', '<', '>'];

/// Reject any argument containing shell metacharacters, NUL bytes or raw
/// control characters.
pub fn validate_command_args<S: AsRef<str>>(args: &[S]) -> Result<(), ValidationError> {
    for (index, arg) in args.iter().enumerate() {
        let arg = arg.as_ref();
        let unsafe_char = arg
            .chars()
            .any(|c| c == '\0' || c.is_control() || SHELL_METACHARACTERS.contains(&c));
        if unsafe_char {
            return Err(ValidationError::UnsafeArgument {
                index,
                arg: arg.to_string(),
            });
        }
    }
    Ok(())
}
