use maud::{html, Markup, Render, DOCTYPE};

pub struct Page {
    pub title: String,
    pub content: Box<dyn Render>,
}

impl Page {
    pub fn new(title: impl Into<String>, content: impl Render + 'static) -> Self {
        Self {
            title: title.into(),
            content: Box::new(content),
        }
    }
}

impl Render for Page {
    fn render(&self) -> Markup {
        html! {
            (DOCTYPE)
            html lang="en" {
                head {
                    meta charset="utf-8";
                    title { (self.title) }
                    script src="https://unpkg.com/@tailwindcss/browser@4" {}
                    meta name="viewport" content="width=device-width, initial-scale=1.0";
                }

                body class="min-h-screen bg-gradient-to-br from-sky-100 via-indigo-50 to-purple-100 py-8 px-4" {
                    header class="text-center mb-6" {
                        h1 class="text-3xl font-bold text-indigo-700" {
                            a href="/" { "Statusphere" }
                        }
                        p class="text-gray-600" { "Set your status on the Atmosphere." }
                    }

                    (self.content.render())
                }
            }
        }
    }
}

impl axum::response::IntoResponse for Page {
    fn into_response(self) -> axum::response::Response {
        self.render().into_response()
    }
}

pub struct Card {
    pub content: Box<dyn Render>,
    pub max_width: Option<String>,
}

impl Card {
    pub fn new(content: impl Render + 'static) -> Self {
        Self {
            content: Box::new(content),
            max_width: None,
        }
    }

    pub fn with_max_width(mut self, max_width: &str) -> Self {
        self.max_width = Some(max_width.to_string());
        self
    }
}

impl Render for Card {
    fn render(&self) -> Markup {
        let width_class = self.max_width.as_deref().unwrap_or("max-w-md");

        html! {
            div class={(width_class) " mx-auto bg-white rounded-xl border border-gray-100 shadow-lg p-6 w-full"} {
                (self.content.render())
            }
        }
    }
}

/// Red notice shown above forms.
pub struct ErrorBanner<'a>(pub &'a str);

impl Render for ErrorBanner<'_> {
    fn render(&self) -> Markup {
        html! {
            div class="mb-4 rounded-md bg-red-50 border border-red-200 px-4 py-2 text-red-700" role="alert" {
                (self.0)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn page_wraps_content_and_escapes_title() {
        let page = Page::new("<Statusphere>", html! { p { "hello" } });
        let markup = page.render().into_string();

        assert!(markup.starts_with("<!DOCTYPE html>"));
        assert!(markup.contains("&lt;Statusphere&gt;"));
        assert!(markup.contains("<p>hello</p>"));
    }
}
