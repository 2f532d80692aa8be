mod backpressure;
mod disk_quota;
mod http_stack;
