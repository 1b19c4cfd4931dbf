//! Single-node runtime behaviour: fork/join through cells, globalised
//! writes, and clean termination.
//!
//! Exactly one `run_par` per test binary — the node identity and the
//! static table are process-wide.

use shoal_closure::{register_builtins, to_closure, Closure};
use shoal_config::RuntimeConfig;
use shoal_runtime::{run_par, IVar, RtError};

#[test]
fn fork_rput_and_terminate() {
    register_builtins().unwrap();
    assert!(
        shoal_runtime::my_node().is_err(),
        "identity must be unset before communication init"
    );
    assert!(shoal_runtime::try_my_node().is_none());

    let out = run_par(RuntimeConfig::single_node(), |par| async move {
        // Identity is fixed once the runtime is up, and this node is the
        // whole cluster.
        let me = shoal_runtime::my_node()?;
        assert_eq!(shoal_runtime::all_nodes()?, &[me]);
        assert_eq!(shoal_runtime::main_node()?, me);
        assert!(shoal_runtime::peers()?.is_empty());

        // Fork/join through a local cell.
        let cell: IVar<i64> = IVar::new();
        {
            let cell = cell.clone();
            par.fork(async move {
                cell.put(11)?;
                Ok(())
            });
        }
        assert_eq!(cell.get().await, 11);

        // Globalised cell, resolved through the local rput path.
        let gcell: IVar<Closure<i64>> = IVar::new();
        let gv = par.glob(&gcell)?;
        assert_eq!(gv.owner(), me);
        par.rput(&gv, to_closure(&23i64)?).await?;
        assert_eq!(gcell.get().await.value()?, 23);

        // A second write through the same handle is the DoublePut error.
        let err = par.rput(&gv, to_closure(&24i64)?).await.unwrap_err();
        assert!(matches!(err, RtError::DoublePut));

        Ok(11 + 23)
    })
    .unwrap();
    assert_eq!(out, Some(34));
}
