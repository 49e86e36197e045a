/// Round a resolution up the way the Pi camera module does for unencoded
/// output: width to a multiple of 32, height to a multiple of 16.
///
/// `None` when the rounded size does not fit in a `u32`.
pub fn raw_resolution(width: u32, height: u32) -> Option<(u32, u32)> {
    let fwidth = width.checked_add(31)? & !31;
    let fheight = height.checked_add(15)? & !15;
    Some((fwidth, fheight))
}

/// Human-readable command line for logs and error messages
pub fn format_command(command: &[String]) -> String {
    command
        .iter()
        .map(|arg| {
            if arg.is_empty() || arg.contains(char::is_whitespace) {
                format!("'{}'", arg)
            } else {
                arg.clone()
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}

/// Replace every `{key}` in `args` by its value
pub fn substitute(args: &[String], vars: &[(&str, &str)]) -> Vec<String> {
    args.iter()
        .map(|arg| {
            vars.iter().fold(arg.clone(), |acc, (key, value)| {
                acc.replace(&format!("{{{}}}", key), value)
            })
        })
        .collect()
}
