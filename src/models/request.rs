use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use reqwest::multipart::{Form, Part};
use reqwest::Method;
use serde::Serialize;

/// Per-call description of an HTTP request. Kept around so the client can
/// re-issue it after a token refresh.
#[derive(Debug, Clone)]
pub struct RequestDescriptor {
    pub method: Method,
    pub path: String,
    pub body: Option<RequestBody>,
    pub headers: HeaderMap,
}

#[derive(Debug, Clone)]
pub enum RequestBody {
    Json(serde_json::Value),
    Form(FormData),
}

impl RequestDescriptor {
    pub fn new(method: Method, path: impl Into<String>) -> Self {
        Self {
            method,
            path: path.into(),
            body: None,
            headers: HeaderMap::new(),
        }
    }

    pub fn get(path: impl Into<String>) -> Self {
        Self::new(Method::GET, path)
    }

    pub fn delete(path: impl Into<String>) -> Self {
        Self::new(Method::DELETE, path)
    }

    /// Attach a JSON body.
    pub fn json<T: Serialize + ?Sized>(mut self, body: &T) -> Result<Self, serde_json::Error> {
        self.body = Some(RequestBody::Json(serde_json::to_value(body)?));
        Ok(self)
    }

    pub fn form(mut self, form: FormData) -> Self {
        self.body = Some(RequestBody::Form(form));
        self
    }

    pub fn header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers.insert(name, value);
        self
    }
}

/// Multipart payload description. `reqwest::multipart::Form` is consumed on
/// send, so the parts are kept here and a fresh form is built per attempt.
#[derive(Debug, Clone, Default)]
pub struct FormData {
    parts: Vec<(String, FormValue)>,
}

#[derive(Debug, Clone)]
pub enum FormValue {
    Text(String),
    File {
        bytes: Vec<u8>,
        file_name: String,
        mime: Option<String>,
    },
}

impl FormData {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn text(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.parts.push((name.into(), FormValue::Text(value.into())));
        self
    }

    pub fn file(
        mut self,
        name: impl Into<String>,
        bytes: Vec<u8>,
        file_name: impl Into<String>,
        mime: Option<&str>,
    ) -> Self {
        self.parts.push((
            name.into(),
            FormValue::File {
                bytes,
                file_name: file_name.into(),
                mime: mime.map(str::to_string),
            },
        ));
        self
    }

    pub fn len(&self) -> usize {
        self.parts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.parts.is_empty()
    }

    /// Build a sendable multipart form.
    pub fn to_form(&self) -> Result<Form, reqwest::Error> {
        let mut form = Form::new();
        for (name, value) in &self.parts {
            form = match value {
                FormValue::Text(text) => form.text(name.clone(), text.clone()),
                FormValue::File {
                    bytes,
                    file_name,
                    mime,
                } => {
                    let mut part = Part::bytes(bytes.clone()).file_name(file_name.clone());
                    if let Some(mime) = mime {
                        part = part.mime_str(mime)?;
                    }
                    form.part(name.clone(), part)
                }
            };
        }
        Ok(form)
    }
}
