use std::collections::BTreeMap;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Secret;
use kube::core::DynamicObject;
use rand::distributions::Alphanumeric;
use rand::Rng;
use tracing::debug;
use trellis_core::labels::account_secret_name;
use trellis_core::Result;
use trellis_graph::{Dag, Vertex};
use trellis_kubehub::ObjectKey;

use crate::stage::{dynamic, typed};
use crate::{TransformContext, Transformer};

const DEFAULT_PASSWORD_LEN: usize = 16;

pub(crate) fn generate_password(len: usize) -> String {
    rand::thread_rng().sample_iter(&Alphanumeric).take(len.max(8)).map(char::from).collect()
}

fn stored_password(secret: &Secret) -> Option<String> {
    if let Some(b) = secret.data.as_ref().and_then(|d| d.get("password")) {
        return String::from_utf8(b.0.clone()).ok();
    }
    secret.string_data.as_ref().and_then(|d| d.get("password")).cloned()
}

/// Materialises each definition's system accounts as Secrets. A generated password is held in
/// the pending-secret cache until the Secret shows up in the store; after that the store wins.
pub struct AccountTransformer;

#[async_trait]
impl Transformer for AccountTransformer {
    fn name(&self) -> &'static str {
        "account"
    }

    async fn transform(&self, ctx: &mut TransformContext, dag: &mut Dag) -> Result<()> {
        let ns = ctx.namespace().to_string();
        let mut creds = BTreeMap::new();
        for comp in &ctx.components {
            let cref = ctx.component_ref(&comp.name);
            for account in &comp.def.spec.system_accounts {
                let name = account_secret_name(ctx.name(), &comp.name, &account.name);
                let key = ObjectKey::for_kind::<Secret>(Some(&ns), name.clone());
                let password = match ctx.reader.get_dynamic(&key).await? {
                    Some(obj) => {
                        let secret: Secret = typed(&obj)?;
                        ctx.secrets.forget(&cref, &account.name);
                        dag.add_vertex(Vertex::noop(obj)?);
                        stored_password(&secret).unwrap_or_default()
                    }
                    None => {
                        let len = account.password_length.unwrap_or(DEFAULT_PASSWORD_LEN);
                        let password = ctx.secrets.get_or_insert_with(&cref, &account.name, || generate_password(len));
                        let secret = Secret {
                            metadata: ctx.owned_meta(name, Some(comp)),
                            type_: Some("Opaque".into()),
                            string_data: Some(BTreeMap::from([
                                ("username".to_string(), account.name.clone()),
                                ("password".to_string(), password.clone()),
                            ])),
                            ..Default::default()
                        };
                        let obj: DynamicObject = dynamic(&secret)?;
                        dag.add_vertex(Vertex::create(obj)?);
                        debug!(cluster = %ctx.name(), component = %comp.name, account = %account.name, "account secret staged");
                        password
                    }
                };
                creds.insert((comp.name.clone(), account.name.clone()), password);
            }
        }
        ctx.credentials.extend(creds);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_passwords_are_alphanumeric_with_a_floor() {
        let p = generate_password(4);
        assert_eq!(p.len(), 8);
        assert!(p.chars().all(|c| c.is_ascii_alphanumeric()));
        assert_ne!(generate_password(24), generate_password(24));
    }
}
