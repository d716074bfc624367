use super::{Context, print_properties, save_after, supervised};
use crate::cli::ConfigCommand;
use crate::property::sdk::SdkProperties;
use crate::property::{self, PropertiesAccessor, PropertyBatch};
use anyhow::Result;
use std::sync::Arc;

pub fn run(ctx: &mut Context, cmd: ConfigCommand) -> Result<()> {
    match cmd {
        ConfigCommand::Show => {
            let engine = ctx.sdk.engine_mut(None)?;
            print_properties(&SdkProperties::new(engine).get());
            Ok(())
        }
        ConfigCommand::Set { assignments } => set(ctx, &assignments),
    }
}

fn set(ctx: &mut Context, args: &[String]) -> Result<()> {
    let assignments = property::parse_assignments(args)?;
    let engine = ctx.sdk.engine_mut(None)?;
    let vm = Arc::clone(engine.virtual_machine());

    let result = {
        let mut batch = PropertyBatch::new(&ctx.reactor, vm, Box::new(SdkProperties::new(engine)), "")
            .with_hook(ctx.hook.as_ref(), "sdk");
        supervised(&ctx.reactor, "config set", || {
            batch.prepare_all(&assignments).and_then(|()| batch.set())
        })
    };
    save_after(&ctx.sdk, result)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commands::testing::context;
    use crate::engine::{PROXY_CONFIG_FILE, ProxyType};
    use crate::error::Error;
    use tempfile::TempDir;

    #[test]
    fn test_set_proxy() {
        let temp = TempDir::new().unwrap();
        let (mut ctx, backend) = context(temp.path());

        set(
            &mut ctx,
            &["proxy=manual".to_string(), "proxy.servers=http://proxy:8080".to_string()],
        )
        .unwrap();

        assert_eq!(ctx.sdk.engine(None).unwrap().www_proxy().kind, ProxyType::Manual);
        assert!(temp.path().join("config").join(PROXY_CONFIG_FILE).exists());
        // The proxy never needs the VM stopped
        assert!(backend.calls().is_empty());
    }

    #[test]
    fn test_missing_servers_rejected() {
        let temp = TempDir::new().unwrap();
        let (mut ctx, _backend) = context(temp.path());

        let err = set(&mut ctx, &["proxy=auto".to_string()]).unwrap_err();

        assert!(matches!(err.downcast_ref::<Error>(), Some(Error::Validation { .. })));
        assert!(!temp.path().join("config").join(PROXY_CONFIG_FILE).exists());
    }
}
