use axum::http::StatusCode;
use axum::response::{Html, IntoResponse, Response};
use color_eyre::Report;

/// A handler failure: the report is logged, `R` is what the browser sees.
#[derive(Debug)]
pub struct ServerError<R: IntoResponse>(pub(crate) Report, pub(crate) R);

pub type ServerResult<S, F = Response> = Result<S, ServerError<F>>;

impl<R: IntoResponse> IntoResponse for ServerError<R> {
    fn into_response(self) -> Response {
        tracing::error!(error = ?self.0, "Request Error");

        let response = self.1.into_response();
        let is_dev_mode = std::env::var("DEVELOPMENT_MODE")
            .map(|v| v == "1")
            .unwrap_or(false);

        if is_dev_mode && response.status() == StatusCode::INTERNAL_SERVER_ERROR {
            let error_text = format!("{:?}", self.0);
            let page = maud::html! {
                html {
                    head { title { "Development Error - 500" } }
                    body style="font-family: monospace; margin: 20px;" {
                        h1 { "Internal Server Error" }
                        pre style="white-space: pre-wrap;" { (error_text) }
                    }
                }
            };
            return (StatusCode::INTERNAL_SERVER_ERROR, Html(page.into_string())).into_response();
        }

        response
    }
}

impl<E> From<E> for ServerError<StatusCode>
where
    E: Into<Report>,
{
    fn from(err: E) -> Self {
        ServerError(err.into(), StatusCode::INTERNAL_SERVER_ERROR)
    }
}

pub(crate) trait WithStatus<T> {
    fn with_status(self, status: StatusCode) -> Result<T, ServerError<StatusCode>>;
}

impl<T, E: Into<Report>> WithStatus<T> for Result<T, E> {
    fn with_status(self, status: StatusCode) -> Result<T, ServerError<StatusCode>> {
        self.map_err(|err| ServerError(err.into(), status))
    }
}
