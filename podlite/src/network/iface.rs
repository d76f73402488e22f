//! Interface name templates.
//!
//! A driver's `containerInterface` is a Go-style template rendered once per
//! pod. It can call `uuid`, `shortuuid`, `num` (interfaces attached so far)
//! and `random n` (up to 32 alphanumeric characters).

use std::cell::RefCell;

use gtmpl::{Context, Func, FuncError, Template, Value};
use podlite_shared::constants::network::MAX_RANDOM_LEN;
use podlite_shared::schema::IpResult;
use podlite_shared::{PodliteError, PodliteResult};
use rand::distr::Alphanumeric;
use rand::Rng;

struct RenderScope {
    uuid: String,
    count: usize,
}

thread_local! {
    static SCOPE: RefCell<Option<RenderScope>> = const { RefCell::new(None) };
}

/// Clears the render scope when dropped.
struct ScopeGuard;

impl ScopeGuard {
    fn enter(scope: RenderScope) -> Self {
        SCOPE.with(|s| *s.borrow_mut() = Some(scope));
        ScopeGuard
    }
}

impl Drop for ScopeGuard {
    fn drop(&mut self) {
        SCOPE.with(|s| *s.borrow_mut() = None);
    }
}

fn with_scope<T>(name: &str, f: impl FnOnce(&RenderScope) -> T) -> Result<T, FuncError> {
    SCOPE.with(|s| {
        s.borrow()
            .as_ref()
            .map(f)
            .ok_or_else(|| FuncError::Generic(format!("{} called outside of a render", name)))
    })
}

fn uuid(_: &[Value]) -> Result<Value, FuncError> {
    with_scope("uuid", |s| Value::from(s.uuid.clone()))
}

fn shortuuid(_: &[Value]) -> Result<Value, FuncError> {
    with_scope("shortuuid", |s| {
        Value::from(s.uuid.get(..8).unwrap_or(&s.uuid).to_string())
    })
}

fn num(_: &[Value]) -> Result<Value, FuncError> {
    with_scope("num", |s| Value::from(s.count as i64))
}

fn random(args: &[Value]) -> Result<Value, FuncError> {
    let requested = args
        .first()
        .and_then(|v| gtmpl_value::from_value::<i64>(v))
        .ok_or_else(|| FuncError::ExactlyXArgs("random".into(), 1))?;
    let len = usize::try_from(requested).unwrap_or(0).min(MAX_RANDOM_LEN);
    Ok(Value::from(random_string(len)))
}

fn random_string(len: usize) -> String {
    rand::rng()
        .sample_iter(&Alphanumeric)
        .take(len)
        .map(char::from)
        .collect()
}

/// Renders `template` for the pod `pod_uuid` and checks the result against
/// the interfaces already attached to it.
pub fn interface_name(template: &str, pod_uuid: &str, attached: &[IpResult]) -> PodliteResult<String> {
    let mut tmpl = Template::default();
    let funcs: [(&str, Func); 4] = [
        ("uuid", uuid),
        ("shortuuid", shortuuid),
        ("num", num),
        ("random", random),
    ];
    tmpl.add_funcs(&funcs);
    tmpl.parse(template).map_err(|e| {
        PodliteError::Network(format!("failed to parse interface template: {}", e))
    })?;

    let name = {
        let _scope = ScopeGuard::enter(RenderScope {
            uuid: pod_uuid.to_string(),
            count: attached.len(),
        });
        tmpl.render(&Context::empty()).map_err(|e| {
            PodliteError::Network(format!("failed to render interface template: {}", e))
        })?
    };

    if attached.iter().any(|r| r.container_interface == name) {
        return Err(PodliteError::Network(format!(
            "interface {:?} is not unique on the container",
            name
        )));
    }
    Ok(name)
}
