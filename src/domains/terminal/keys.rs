//! Stable terminal session keys. The key doubles as the Event Bus terminal
//! topic suffix, so it must be deterministic per cell/service.

pub fn shell_terminal_key(cell_id: &str) -> String {
    format!("cell-{cell_id}-shell")
}

pub fn chat_terminal_key(cell_id: &str) -> String {
    format!("cell-{cell_id}-chat")
}

pub fn setup_terminal_key(cell_id: &str) -> String {
    format!("cell-{cell_id}-setup")
}

pub fn service_terminal_key(service_id: &str) -> String {
    format!("service-{service_id}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keys_are_distinct_per_flavor() {
        let keys = [
            shell_terminal_key("c1"),
            chat_terminal_key("c1"),
            setup_terminal_key("c1"),
            service_terminal_key("c1"),
        ];
        let unique: std::collections::HashSet<_> = keys.iter().collect();
        assert_eq!(unique.len(), keys.len());
    }

    #[test]
    fn keys_are_deterministic() {
        assert_eq!(shell_terminal_key("abc"), "cell-abc-shell");
        assert_eq!(service_terminal_key("svc9"), "service-svc9");
    }
}
