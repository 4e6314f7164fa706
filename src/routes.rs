//! 顶层请求路由。

use axum::Router;
use axum::extract::{DefaultBodyLimit, Extension};
use axum::response::{IntoResponse, Redirect, Response};
use axum::routing::get;
use std::sync::Arc;

use crate::assets::{self, NotFoundPage};
use crate::auth::{self, AuthConfig};
use crate::config::SETUP_PATH;
use crate::error::ApiError;
use crate::pages::{self, PageConfig};
use crate::storage::AssetStore;
use crate::upload::{self, UploadConfig};

/// 处理器共享的状态，通过 `Extension` 层注入。
#[derive(Clone)]
pub struct AppContext {
    pub assets: Arc<AssetStore>,
    pub auth: Arc<AuthConfig>,
    pub upload: Arc<UploadConfig>,
    pub pages: Arc<PageConfig>,
    pub not_found: Arc<NotFoundPage>,
    /// 上传请求体上限，0 表示不限制。
    pub upload_max_size: u64,
}

pub fn build_router(ctx: AppContext) -> Router {
    let body_limit = if ctx.upload_max_size == 0 {
        DefaultBodyLimit::disable()
    } else {
        DefaultBodyLimit::max(usize::try_from(ctx.upload_max_size).unwrap_or(usize::MAX))
    };

    Router::new()
        .route(
            "/",
            get(upload_page)
                .post(upload::upload_image)
                .fallback(method_not_allowed)
                .layer(body_limit),
        )
        .route(
            SETUP_PATH,
            get(auth::setup_page)
                .post(auth::complete_setup)
                .fallback(method_not_allowed),
        )
        .route(
            "/{*path}",
            get(assets::serve_asset).fallback(method_not_allowed),
        )
        .fallback(not_found)
        .layer(Extension(ctx.assets))
        .layer(Extension(ctx.auth))
        .layer(Extension(ctx.upload))
        .layer(Extension(ctx.pages))
        .layer(Extension(ctx.not_found))
}

/// `GET /`：上传表单，首次运行时重定向到设置页。
async fn upload_page(
    Extension(auth): Extension<Arc<AuthConfig>>,
    Extension(page_config): Extension<Arc<PageConfig>>,
    Extension(not_found): Extension<Arc<NotFoundPage>>,
) -> Result<Response, ApiError> {
    if !page_config.upload_page {
        return not_found.response().await;
    }
    if auth.needs_setup().await {
        return Ok(Redirect::to(SETUP_PATH).into_response());
    }
    Ok(pages::render_upload(&page_config.accept, auth.enabled)?.into_response())
}

async fn method_not_allowed() -> ApiError {
    ApiError::MethodNotAllowed
}

async fn not_found(
    Extension(not_found): Extension<Arc<NotFoundPage>>,
) -> Result<Response, ApiError> {
    not_found.response().await
}

#[cfg(test)]
mod tests {
    use super::{AppContext, build_router};
    use crate::assets::NotFoundPage;
    use crate::auth::AuthConfig;
    use crate::config::NamingScheme;
    use crate::credential::CredentialStore;
    use crate::extensions::AllowedExtensions;
    use crate::pages::PageConfig;
    use crate::storage::AssetStore;
    use crate::upload::UploadConfig;
    use axum::Router;
    use axum::body::Body;
    use axum::http::{Request, StatusCode, header};
    use axum::response::Response;
    use std::path::{Path, PathBuf};
    use std::sync::Arc;
    use tempfile::{TempDir, tempdir};
    use tower::ServiceExt;

    const BOUNDARY: &str = "picbin-test-boundary";
    const PNG_BYTES: &[u8] = b"\x89PNG\r\n\x1a\nfake image body";

    struct Harness {
        temp: TempDir,
        app: Router,
        auth: Arc<AuthConfig>,
    }

    impl Harness {
        fn asset_dir(&self) -> PathBuf {
            self.temp.path().join("IMG")
        }

        fn stored_files(&self) -> Vec<String> {
            let mut names: Vec<String> = std::fs::read_dir(self.asset_dir())
                .expect("read asset dir")
                .map(|entry| entry.expect("entry").file_name().to_string_lossy().into_owned())
                .collect();
            names.sort();
            names
        }

        async fn send(&self, request: Request<Body>) -> Response {
            self.app.clone().oneshot(request).await.expect("response")
        }

        /// 用新密钥完成设置流程并返回该密钥。
        async fn enroll(&self) -> String {
            let (secret, _) = self.auth.generate_secret().expect("generate");
            let code = self.auth.current_code(&secret);
            let response = self.send(setup_request(&secret, &code)).await;
            assert_eq!(response.status(), StatusCode::SEE_OTHER);
            secret
        }
    }

    fn harness_with(
        configure: impl FnOnce(&mut AuthConfig, &mut UploadConfig, &mut PageConfig),
    ) -> Harness {
        let temp = tempdir().expect("tempdir");
        let root = temp.path().join("IMG");
        std::fs::create_dir_all(&root).expect("create asset root");

        let extensions = AllowedExtensions::default();
        let mut auth = AuthConfig {
            enabled: true,
            issuer: "picbin".into(),
            account: "user".into(),
            credentials: CredentialStore::new(temp.path().join("totp.key")),
        };
        let mut upload = UploadConfig {
            naming: NamingScheme::ContentHash,
            memory_threshold: 10 * 1024 * 1024,
        };
        let mut page_config = PageConfig {
            upload_page: true,
            accept: extensions.accept_list(),
        };
        configure(&mut auth, &mut upload, &mut page_config);

        let not_found = NotFoundPage::new(temp.path().join("404.html"));
        let assets = AssetStore::new(root, extensions, not_found.reserved_name());
        let auth = Arc::new(auth);
        let app = build_router(AppContext {
            assets: Arc::new(assets),
            auth: auth.clone(),
            upload: Arc::new(upload),
            pages: Arc::new(page_config),
            not_found: Arc::new(not_found),
            upload_max_size: 0,
        });
        Harness { temp, app, auth }
    }

    fn harness() -> Harness {
        harness_with(|_, _, _| {})
    }

    fn get(uri: &str) -> Request<Body> {
        Request::builder()
            .uri(uri)
            .body(Body::empty())
            .expect("request")
    }

    fn setup_request(secret: &str, code: &str) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri("/setup-totp")
            .header(header::CONTENT_TYPE, "application/x-www-form-urlencoded")
            .body(Body::from(format!("totpKey={secret}&totpCode={code}")))
            .expect("request")
    }

    enum Part<'a> {
        File(&'a str, &'a str, &'a [u8]),
        Text(&'a str, &'a str),
    }

    fn upload_request(parts: &[Part<'_>]) -> Request<Body> {
        let mut body = Vec::new();
        for part in parts {
            body.extend_from_slice(format!("--{BOUNDARY}\r\n").as_bytes());
            match part {
                Part::File(name, file_name, data) => {
                    body.extend_from_slice(
                        format!(
                            "Content-Disposition: form-data; name=\"{name}\"; filename=\"{file_name}\"\r\nContent-Type: application/octet-stream\r\n\r\n"
                        )
                        .as_bytes(),
                    );
                    body.extend_from_slice(data);
                }
                Part::Text(name, value) => {
                    body.extend_from_slice(
                        format!("Content-Disposition: form-data; name=\"{name}\"\r\n\r\n")
                            .as_bytes(),
                    );
                    body.extend_from_slice(value.as_bytes());
                }
            }
            body.extend_from_slice(b"\r\n");
        }
        body.extend_from_slice(format!("--{BOUNDARY}--\r\n").as_bytes());

        Request::builder()
            .method("POST")
            .uri("/")
            .header(
                header::CONTENT_TYPE,
                format!("multipart/form-data; boundary={BOUNDARY}"),
            )
            .body(Body::from(body))
            .expect("request")
    }

    fn location(response: &Response) -> String {
        response.headers()[header::LOCATION]
            .to_str()
            .expect("location")
            .to_string()
    }

    async fn body_bytes(response: Response) -> Vec<u8> {
        axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .expect("body")
            .to_vec()
    }

    fn md5_hex(data: &[u8]) -> String {
        format!("{:x}", md5::compute(data))
    }

    #[tokio::test]
    async fn uninitialized_credential_redirects_uploads_to_setup() {
        let h = harness();
        let request = upload_request(&[
            Part::File("imageFile", "cat.png", PNG_BYTES),
            Part::Text("totp", "123456"),
        ]);
        let response = h.send(request).await;
        assert_eq!(response.status(), StatusCode::SEE_OTHER);
        assert_eq!(location(&response), "/setup-totp");
        assert!(h.stored_files().is_empty());

        let response = h.send(get("/")).await;
        assert_eq!(response.status(), StatusCode::SEE_OTHER);
        assert_eq!(location(&response), "/setup-totp");
    }

    #[tokio::test]
    async fn setup_page_offers_a_secret_until_enrolled() {
        let h = harness();
        let response = h.send(get("/setup-totp")).await;
        assert_eq!(response.status(), StatusCode::OK);
        let page = String::from_utf8(body_bytes(response).await).expect("utf8");
        assert!(page.contains("otpauth://totp/"));
        assert!(page.contains(r#"name="totpKey""#));

        h.enroll().await;
        let response = h.send(get("/setup-totp")).await;
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn setup_rejects_bad_code_and_missing_fields() {
        let h = harness();
        let (secret, _) = h.auth.generate_secret().expect("generate");
        let (other, _) = h.auth.generate_secret().expect("generate");

        let response = h
            .send(setup_request(&secret, &h.auth.current_code(&other)))
            .await;
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        let response = h.send(setup_request(&secret, "")).await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert!(!h.temp.path().join("totp.key").exists());
    }

    #[tokio::test]
    async fn enrolled_secret_authorizes_uploads() {
        let h = harness();
        let secret = h.enroll().await;
        assert_eq!(
            std::fs::read_to_string(h.temp.path().join("totp.key")).expect("key"),
            secret
        );
        let response = h
            .send(setup_request(&secret, &h.auth.current_code(&secret)))
            .await;
        assert_eq!(response.status(), StatusCode::FORBIDDEN);

        let code = h.auth.current_code(&secret);
        let response = h
            .send(upload_request(&[
                Part::File("imageFile", "Cat.PNG", PNG_BYTES),
                Part::Text("totp", &code),
            ]))
            .await;
        assert_eq!(response.status(), StatusCode::SEE_OTHER);
        let expected = format!("{}.png", md5_hex(PNG_BYTES));
        assert_eq!(location(&response), format!("/{expected}"));
        assert_eq!(
            std::fs::read(h.asset_dir().join(&expected)).expect("stored"),
            PNG_BYTES
        );

        let (other, _) = h.auth.generate_secret().expect("generate");
        let response = h
            .send(upload_request(&[
                Part::File("imageFile", "dog.png", b"other bytes"),
                Part::Text("totp", &h.auth.current_code(&other)),
            ]))
            .await;
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(h.stored_files(), vec![expected]);
    }

    #[tokio::test]
    async fn upload_validation_failures_are_bad_requests() {
        let h = harness();
        let secret = h.enroll().await;
        let code = h.auth.current_code(&secret);

        let cases = [
            upload_request(&[
                Part::File("imageFile", "run.exe", b"MZ"),
                Part::Text("totp", &code),
            ]),
            upload_request(&[Part::File("imageFile", "cat.png", PNG_BYTES)]),
            upload_request(&[Part::Text("totp", &code)]),
            upload_request(&[
                Part::File("imageFile", "", b""),
                Part::Text("totp", &code),
            ]),
            upload_request(&[
                Part::File("imageFile", "a.png", b"a"),
                Part::File("file", "b.png", b"b"),
                Part::Text("totp", &code),
            ]),
        ];
        for request in cases {
            let response = h.send(request).await;
            assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        }

        let not_multipart = Request::builder()
            .method("POST")
            .uri("/")
            .header(header::CONTENT_TYPE, "text/plain")
            .body(Body::from("hello"))
            .expect("request");
        let response = h.send(not_multipart).await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert!(h.stored_files().is_empty());
    }

    #[tokio::test]
    async fn oversized_code_field_is_rejected_before_verification() {
        let h = harness();
        let secret = h.enroll().await;
        let code = h.auth.current_code(&secret);
        let padded = format!("{code}{}", " ".repeat(4 * 1024 * 1024));

        let response = h
            .send(upload_request(&[
                Part::File("imageFile", "cat.png", PNG_BYTES),
                Part::Text("totp", &padded),
            ]))
            .await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert!(h.stored_files().is_empty());

        let response = h
            .send(upload_request(&[
                Part::File("imageFile", "cat.png", PNG_BYTES),
                Part::Text("totp", &code),
            ]))
            .await;
        assert_eq!(response.status(), StatusCode::SEE_OTHER);
    }

    #[tokio::test]
    async fn identical_content_maps_to_one_file() {
        let h = harness_with(|auth, _, _| auth.enabled = false);
        let mut locations = Vec::new();
        for file_name in ["first.png", "second.png"] {
            let response = h
                .send(upload_request(&[Part::File("file", file_name, PNG_BYTES)]))
                .await;
            assert_eq!(response.status(), StatusCode::SEE_OTHER);
            locations.push(location(&response));
        }
        assert_eq!(locations[0], locations[1]);
        assert_eq!(h.stored_files().len(), 1);

        let response = h
            .send(upload_request(&[Part::File("file", "third.gif", PNG_BYTES)]))
            .await;
        assert_ne!(location(&response), locations[0]);
        assert_eq!(h.stored_files().len(), 2);
    }

    #[tokio::test]
    async fn timestamp_naming_uses_milliseconds() {
        let h = harness_with(|auth, upload, _| {
            auth.enabled = false;
            upload.naming = NamingScheme::Timestamp;
        });
        let response = h
            .send(upload_request(&[Part::File("imageFile", "a.webp", b"riff")]))
            .await;
        assert_eq!(response.status(), StatusCode::SEE_OTHER);
        let location = location(&response);
        let stem = location
            .strip_prefix('/')
            .and_then(|name| name.strip_suffix(".webp"))
            .expect("timestamp name");
        assert!(stem.len() >= 13 && stem.chars().all(|c| c.is_ascii_digit()));
    }

    #[tokio::test]
    async fn large_upload_spills_without_leaving_temp_files() {
        let h = harness_with(|auth, upload, _| {
            auth.enabled = false;
            upload.memory_threshold = 8;
        });
        let data: Vec<u8> = (0..4096u32).map(|i| (i % 251) as u8).collect();
        let response = h
            .send(upload_request(&[Part::File("imageFile", "big.bmp", &data)]))
            .await;
        assert_eq!(response.status(), StatusCode::SEE_OTHER);
        let expected = format!("{}.bmp", md5_hex(&data));
        assert_eq!(h.stored_files(), vec![expected.clone()]);
        assert_eq!(
            std::fs::read(h.asset_dir().join(expected)).expect("stored"),
            data
        );
    }

    #[tokio::test]
    async fn serves_stored_asset_with_cache_headers() {
        let h = harness();
        std::fs::write(h.asset_dir().join("abc123.png"), PNG_BYTES).expect("write asset");

        let response = h.send(get("/abc123.png")).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()[header::CONTENT_TYPE], "image/png");
        let etag = response.headers()[header::ETAG].clone();
        assert!(response.headers().contains_key(header::LAST_MODIFIED));
        assert_eq!(body_bytes(response).await, PNG_BYTES);

        let conditional = Request::builder()
            .uri("/abc123.png")
            .header(header::IF_NONE_MATCH, etag)
            .body(Body::empty())
            .expect("request");
        let response = h.send(conditional).await;
        assert_eq!(response.status(), StatusCode::NOT_MODIFIED);

        let ranged = Request::builder()
            .uri("/abc123.png")
            .header(header::RANGE, "bytes=0-3")
            .body(Body::empty())
            .expect("request");
        let response = h.send(ranged).await;
        assert_eq!(response.status(), StatusCode::PARTIAL_CONTENT);
        assert_eq!(body_bytes(response).await, &PNG_BYTES[..4]);
    }

    #[tokio::test]
    async fn missing_asset_uses_not_found_fallback() {
        let h = harness();
        let response = h.send(get("/nonexistent.png")).await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert_eq!(body_bytes(response).await, b"404 Not Found");

        std::fs::write(h.temp.path().join("404.html"), "<p>lost</p>").expect("write page");
        let response = h.send(get("/nonexistent.png")).await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert_eq!(body_bytes(response).await, b"<p>lost</p>");
    }

    #[tokio::test]
    async fn guard_rejections_are_forbidden() {
        let h = harness();
        write(&h.temp.path().join("secret.png"), b"outside");
        write(&h.asset_dir().join("notes.txt"), b"text");
        write(&h.asset_dir().join("404.html"), b"reserved");
        std::fs::create_dir_all(h.asset_dir().join("sub")).expect("create sub");
        write(&h.asset_dir().join("sub/inner.png"), b"nested");

        for uri in [
            "/../secret.png",
            "/..%2fsecret.png",
            "/%2e%2e/secret.png",
            "/sub/inner.png",
            "/sub",
            "/missing/inner.png",
            "/404.html",
            "/notes.txt",
        ] {
            let response = h.send(get(uri)).await;
            assert_eq!(response.status(), StatusCode::FORBIDDEN, "{uri}");
        }
    }

    #[tokio::test]
    async fn unsupported_methods_are_rejected() {
        let h = harness();
        std::fs::write(h.asset_dir().join("abc.png"), PNG_BYTES).expect("write asset");
        for (method, uri) in [("DELETE", "/"), ("PUT", "/"), ("POST", "/abc.png")] {
            let request = Request::builder()
                .method(method)
                .uri(uri)
                .body(Body::empty())
                .expect("request");
            let response = h.send(request).await;
            assert_eq!(response.status(), StatusCode::METHOD_NOT_ALLOWED, "{method} {uri}");
        }
    }

    #[tokio::test]
    async fn upload_page_reflects_configuration() {
        let h = harness();
        h.enroll().await;
        let response = h.send(get("/")).await;
        assert_eq!(response.status(), StatusCode::OK);
        let page = String::from_utf8(body_bytes(response).await).expect("utf8");
        assert!(page.contains(r#"name="imageFile""#));
        assert!(page.contains(r#"name="totp""#));

        let hidden = harness_with(|_, _, page| page.upload_page = false);
        let response = hidden.send(get("/")).await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    fn write(path: &Path, data: &[u8]) {
        std::fs::write(path, data).expect("write file");
    }
}
