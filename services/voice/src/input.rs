/// What one line typed at the prompt asks for.
#[derive(Debug, PartialEq, Eq)]
pub enum Input {
    Send(String),
    ToggleCapture,
    Quit,
    Nothing,
}

pub fn parse_line(line: &str) -> Input {
    match line.trim() {
        "" => Input::Nothing,
        "/mic" => Input::ToggleCapture,
        "/quit" | "/exit" => Input::Quit,
        _ => Input::Send(line.trim_end_matches(['\r', '\n']).to_string()),
    }
}
