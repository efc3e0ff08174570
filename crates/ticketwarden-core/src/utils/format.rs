use chrono::Duration;

/// Truncate a string to a maximum number of characters, adding ellipsis if needed
pub fn truncate(s: &str, max_chars: usize) -> String {
    let count = s.chars().count();
    if count <= max_chars {
        s.to_string()
    } else if max_chars <= 3 {
        s.chars().take(max_chars).collect()
    } else {
        let truncated: String = s.chars().take(max_chars - 3).collect();
        format!("{}...", truncated)
    }
}

/// Render an elapsed duration compactly ("just now", "12m", "3h 5m", "2d 4h")
pub fn format_age(age: Duration) -> String {
    let minutes = age.num_minutes();
    if minutes < 1 {
        // Negative ages come from clock skew
        "just now".to_string()
    } else if minutes < 60 {
        format!("{}m", minutes)
    } else if minutes < 1440 {
        let hours = minutes / 60;
        match minutes % 60 {
            0 => format!("{}h", hours),
            rem => format!("{}h {}m", hours, rem),
        }
    } else {
        let days = minutes / 1440;
        match (minutes % 1440) / 60 {
            0 => format!("{}d", days),
            rem => format!("{}d {}h", days, rem),
        }
    }
}
