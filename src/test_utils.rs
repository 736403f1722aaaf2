pub fn trace_init() {
    let subscriber = tracing_subscriber::fmt().finish();
    let _ = tracing::subscriber::set_global_default(subscriber);
}
