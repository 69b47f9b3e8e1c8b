use tsunagi::{Definition, Exports, PoolFetcher, Resolver};

/// Two modules that depend on each other.
///
/// `a` needs `b` to be ready, while `b` asks for `a` again from inside its
/// own factory through the injected `require`. The static cycle is broken by
/// running `b` first, the dynamic request is answered once `a` is done.
///
/// Run with `RUST_LOG=tsunagi=debug` to see every transition.
struct Greeter {
    name: &'static str,
}

impl Greeter {
    fn hi(&self) {
        println!("hi from {}", self.name);
    }

    fn goodbye(&self) {
        println!("goodbye from {}", self.name);
    }
}

fn source(name: &str) -> anyhow::Result<Option<Definition>> {
    let definition = match name {
        "a" => Definition::new().depends_on(["b"]).on_ready(|args| {
            if let Some(b) = args.get::<Greeter>(0) {
                b.goodbye();
            }
            Ok(Exports::new(Greeter { name: "a" }))
        }),
        "b" => Definition::new().depends_on(["require", "a"]).on_ready(|args| {
            println!("b runs first, a is undefined: {}", args.is_undefined(1));

            if let Some(require) = args.require() {
                require.require(["a"], |args| {
                    if let Some(a) = args.get::<Greeter>(0) {
                        a.hi();
                    }
                    Ok(Exports::none())
                })?;
            }

            Ok(Exports::new(Greeter { name: "b" }))
        }),
        other => anyhow::bail!("unknown module '{other}'"),
    };

    Ok(Some(definition))
}

fn main() -> anyhow::Result<()> {
    tsunagi::init_logging();

    let mut resolver = Resolver::new(PoolFetcher::new(source));

    resolver.require(["a"], |_| {
        println!("everything loaded");
        Ok(Exports::none())
    })?;
    resolver.run_until_settled();

    println!("{}", resolver.diagnostics().render_mermaid());
    Ok(())
}
