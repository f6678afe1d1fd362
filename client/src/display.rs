/// Renders a received message the way the terminal shows it
pub fn format_message(user: &str, text: &str) -> String {
    format!("{}: {}\n", user, text)
}
