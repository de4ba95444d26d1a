mod support;

mod test_clock;
mod test_in_memory_pipeline;
