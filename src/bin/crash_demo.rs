// Installs the fault handler, then crashes a few calls deep so every strategy has a chain to walk.
//
// Usage: crash_demo [--strategy <name>]...

extern crate crashtrace;
extern crate env_logger;

#[cfg(any(target_os = "linux", target_os = "android"))]
mod demo {
    use crashtrace::{HandlerConfig, Strategy};
    use std::hint::black_box;
    use std::ptr;

    #[inline(never)]
    fn pre_crash3() {
        black_box(3);
    }

    #[inline(never)]
    fn pre_crash2() {
        pre_crash3();
    }

    #[inline(never)]
    fn pre_crash1() {
        pre_crash2();
    }

    #[inline(never)]
    fn crash() {
        pre_crash1();

        // Non-null and aligned, but the first page is never mapped.
        let p = black_box(8usize) as *mut i32;
        unsafe { ptr::write_volatile(p, 0) };
    }

    #[inline(never)]
    fn func1() {
        crash();
    }

    #[inline(never)]
    fn func2() {
        func1();
    }

    #[inline(never)]
    fn func3() {
        func2();
    }

    fn parse_strategies() -> Result<Option<Vec<Strategy>>, crashtrace::Error> {
        let mut args = std::env::args();
        args.next();
        let mut strategies = Vec::new();
        while let Some(arg) = args.next() {
            if arg != "--strategy" {
                return Err(crashtrace::Error::UnknownStrategy(arg));
            }
            let name = args.next().unwrap_or_default();
            strategies.push(name.parse()?);
        }
        Ok(if strategies.is_empty() {
            None
        } else {
            Some(strategies)
        })
    }

    pub fn main() {
        let mut config = HandlerConfig::new();
        match parse_strategies() {
            Ok(Some(strategies)) => config = config.strategies(strategies),
            Ok(None) => {}
            Err(e) => {
                eprintln!("{}", e);
                std::process::exit(2);
            }
        }

        let _handle = match crashtrace::install(config) {
            Ok(handle) => handle,
            Err(e) => {
                eprintln!("failed to install the fault handler: {}", e);
                std::process::exit(1);
            }
        };

        func3();

        println!("Returned from the signal handler?");
    }
}

fn main() {
    env_logger::init();

    #[cfg(any(target_os = "linux", target_os = "android"))]
    demo::main();

    #[cfg(not(any(target_os = "linux", target_os = "android")))]
    eprintln!("crash_demo only runs on Linux and Android");
}
