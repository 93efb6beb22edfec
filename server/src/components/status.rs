use chrono::{DateTime, Utc};
use maud::{html, Markup, Render};

use crate::status::{Status, AVAILABLE_STATUSES};

/// Grid of emoji buttons posting to `/status`.
pub struct StatusPicker<'a> {
    pub current: Option<&'a str>,
}

impl Render for StatusPicker<'_> {
    fn render(&self) -> Markup {
        html! {
            form action="/status" method="post" class="grid grid-cols-7 gap-2 my-4" {
                @for status in AVAILABLE_STATUSES {
                    @let border = if self.current == Some(*status) {
                        "border-indigo-500 bg-indigo-100"
                    } else {
                        "border-gray-200"
                    };
                    button type="submit" name="status" value=(status)
                        class={"text-2xl rounded-lg p-2 border hover:bg-indigo-50 " (border)} {
                        (status)
                    }
                }
            }
        }
    }
}

pub struct StatusList<'a> {
    pub statuses: &'a [Status],
    pub viewer: Option<&'a str>,
}

impl Render for StatusList<'_> {
    fn render(&self) -> Markup {
        html! {
            @if self.statuses.is_empty() {
                p class="text-gray-500 text-center" { "No statuses yet." }
            }
            ul class="space-y-2" {
                @for status in self.statuses {
                    li class="flex items-center gap-3" {
                        span class="text-2xl" { (status.status) }
                        span class="text-gray-700" {
                            @if self.viewer == Some(status.author_did.as_str()) {
                                "You"
                            } @else {
                                (status.author_did)
                            }
                            " " (describe_when(status.created_at, Utc::now()))
                        }
                    }
                }
            }
        }
    }
}

fn describe_when(created_at: DateTime<Utc>, now: DateTime<Utc>) -> String {
    if created_at.date_naive() == now.date_naive() {
        "is feeling this today".to_string()
    } else {
        format!("was feeling this on {}", created_at.format("%b %-d, %Y"))
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;

    #[test]
    fn statuses_from_today_read_as_today() {
        let now = Utc.with_ymd_and_hms(2025, 3, 1, 18, 0, 0).unwrap();
        let earlier = Utc.with_ymd_and_hms(2025, 3, 1, 9, 30, 0).unwrap();
        let last_week = Utc.with_ymd_and_hms(2025, 2, 22, 9, 30, 0).unwrap();

        assert_eq!(describe_when(earlier, now), "is feeling this today");
        assert_eq!(describe_when(last_week, now), "was feeling this on Feb 22, 2025");
    }

    #[test]
    fn picker_highlights_current_status() {
        let markup = StatusPicker { current: Some("🦋") }.render().into_string();
        assert_eq!(markup.matches("border-indigo-500").count(), 1);
        assert!(markup.contains("🦋"));
    }
}
